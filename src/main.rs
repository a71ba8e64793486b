#[tokio::main]
async fn main() {
    kedge::cli::init().await;
}
