use appforge::Engine;
use std::time::Duration;

pub async fn run_logs(
    engine: &Engine,
    name: &str,
    tail: Option<usize>,
    follow: bool,
) -> anyhow::Result<()> {
    let lines = engine.logs(name, tail).await?;
    for line in &lines {
        println!("{}", line);
    }
    if !follow {
        return Ok(());
    }

    // Re-read the whole capture and print what is new since the last poll.
    let mut seen = engine.logs(name, None).await?.len();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let logs = engine.logs(name, None).await?;
                if logs.len() < seen {
                    // Capture was rotated or truncated
                    seen = 0;
                }
                for line in logs.iter().skip(seen) {
                    println!("{}", line);
                }
                seen = logs.len();
            }
        }
    }
    Ok(())
}
