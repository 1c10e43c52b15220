fn main() {
    if let Err(err) = bulk_import::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
