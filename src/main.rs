// SPDX-License-Identifier: GPL-3.0-only

use std::process::ExitCode;

fn main() -> ExitCode {
    match payload_dumper::cli::args::main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
