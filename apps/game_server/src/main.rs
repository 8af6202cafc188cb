use clap::Parser;
use game_server::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	let args = Args::parse();
	game_server::main(args).await
}
