use std::process;

fn main() {
    if let Err(err) = mergeline::app::run() {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}
