use std::process::ExitCode;

fn main() -> ExitCode {
    proxymond::run()
}
