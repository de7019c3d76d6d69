//! CLI entrypoint of the archiver engine.

fn main() -> Result<(), archiver::Failure> {
    archiver::run()
}
