use clap::Parser;

fn main() {
    let cli = plaudctl::Cli::parse();
    if let Err(err) = plaudctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
