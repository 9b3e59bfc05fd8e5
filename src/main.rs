use std::process::ExitCode;

fn main() -> ExitCode {
    match omero_transfer::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let omero_transfer::MigrateError::InvalidDocument { report, .. } = &e {
                eprint!("{}", report);
            }
            ExitCode::FAILURE
        }
    }
}
