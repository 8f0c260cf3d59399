fn main() {
    if let Err(e) = termchat_lib::run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
