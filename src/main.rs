#[tokio::main]
async fn main() {
    std::process::exit(axiom_supervisor::run().await);
}
