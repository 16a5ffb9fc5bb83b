use zrelay::config::ConfigError;
use zrelay::zfs::ReplicationError;

#[tokio::main]
async fn main() {
    let code = match zrelay::run().await {
        Ok(()) => 0,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

/// Print `error[<kind>]: <message>` and pick the exit code.
fn report(err: &anyhow::Error) -> i32 {
    if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
        let _ = clap_err.print();
        return clap_err.exit_code();
    }
    let (kind, code) = if let Some(e) = err.downcast_ref::<ReplicationError>() {
        (e.kind(), e.exit_code())
    } else if let Some(e) = err.downcast_ref::<ConfigError>() {
        (e.kind(), e.exit_code())
    } else {
        ("internal", 1)
    };
    eprintln!("error[{kind}]: {err:#}");
    code
}
