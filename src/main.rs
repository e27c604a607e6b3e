//! Terminal drawing client
//!
//! Lines on stdin: `x y` draws to a point, `end` lifts the pen, `quit`
//! leaves. Remote strokes are logged.

use anyhow::Context;
use scribble_rtc::{DrawEvent, SessionController, StrokeUpdate};
use tokio::io::{self, AsyncBufReadExt};

enum Command {
    Draw(f64, f64),
    End,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    match line {
        "end" => return Some(Command::End),
        "quit" => return Some(Command::Quit),
        _ => {}
    }

    let mut parts = line.split_whitespace();
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Command::Draw(x, y))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scribble_rtc::init_tracing();

    let session = SessionController::from_env().context("invalid configuration")?;
    tracing::info!("Using signaling relay {}", session.config().signaling_url);

    session.on_stroke(|update| match update {
        StrokeUpdate::Begin { x, y } => tracing::info!("Remote stroke begins at ({}, {})", x, y),
        StrokeUpdate::Extend { x, y } => tracing::info!("Remote stroke to ({}, {})", x, y),
        StrokeUpdate::End => tracing::info!("Remote stroke ended"),
    });

    let id = session
        .connect()
        .await
        .context("failed to connect to signaling relay")?;
    tracing::info!("Session {} started, waiting for a peer", id);

    let mut states = session.watch();
    let mut stdin = io::BufReader::new(io::stdin()).lines();
    let mut last = (0.0, 0.0);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Status: {:?} ({})", session.status(), state);
            }

            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Some(Command::Draw(x, y)) => {
                        last = (x, y);
                        session.send(DrawEvent::point(x, y)).await;
                    }
                    Some(Command::End) => session.send(DrawEvent::end_line(last.0, last.1)).await,
                    Some(Command::Quit) => break,
                    None => tracing::warn!("Unknown command '{}', use `x y`, `end` or `quit`", line.trim()),
                }
            }
        }
    }

    session.disconnect().await;
    Ok(())
}
