#[rocket::main]
async fn main() {
    if let Err(e) = agent_gateway::build().await.launch().await {
        eprintln!("🔥 agent gateway failed to launch: {e}");
        std::process::exit(1);
    }
}
