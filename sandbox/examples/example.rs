use std::time::Duration;

use oj_shared::ProgrammingLanguage;
use sandbox::local::LocalSandbox;
use sandbox::{ExecLimits, ExecResult, Sandbox};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = std::env::temp_dir().join("oj-sandbox-example");
    std::fs::create_dir_all(&work_dir)?;

    let sandbox = LocalSandbox::new(&work_dir);
    let code = b"print(input())\n";
    let limits = ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024);

    let outcome = sandbox
        .execute(ProgrammingLanguage::Python, code, b"Echo this\n", limits)
        .await?;

    match outcome.result {
        ExecResult::Ok => println!(
            "stdout: {}",
            String::from_utf8_lossy(&outcome.stdout)
        ),
        other => println!("execution did not succeed: {other:?}"),
    }

    Ok(())
}
