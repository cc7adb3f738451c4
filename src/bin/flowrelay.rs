use flowrelay::app::command_handlers;
use flowrelay::shared::logging::init_tracing;

fn run() -> Result<(), String> {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let output = command_handlers::run_cli(args)?;
    println!("{output}");
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
