use std::process::ExitCode;

fn main() -> ExitCode {
    match localbridge::cli::main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
