//! Source -> uppercase transform -> sink, with asynchronous hooks
//!
//! Run with: cargo run --example uppercase_pipe [LINES]
//!
//! The source produces LINES lines (default 8) from a timer task, the
//! transform uppercases them and the sink "flushes" each one after a short
//! delay. Set `RUST_LOG=chunkflow=trace` to watch backpressure at work.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chunkflow::{
    Chunk, Emitter, Scheduler, SinkStream, SourceStream, StreamConfig, TransformStream,
};

fn text(chunk: &Chunk) -> String {
    String::from_utf8_lossy(chunk.as_bytes().unwrap_or_default()).into_owned()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let lines: u32 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 8,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chunkflow=debug".parse()?)
                .add_directive("uppercase_pipe=info".parse()?),
        )
        .init();

    let local = tokio::task::LocalSet::new();
    let scheduler = Scheduler::new();

    local
        .run_until(scheduler.run_until(async {
            let produced = Rc::new(Cell::new(0u32));
            let source = SourceStream::new(
                &scheduler,
                StreamConfig::default().high_water_mark(32),
                move |source, size| {
                    let source = source.clone();
                    let produced = produced.clone();
                    tracing::debug!(size, "source asked for data");
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let n = produced.get();
                        if n == lines {
                            source.push(None);
                            return;
                        }
                        produced.set(n + 1);
                        source.push(Some(Chunk::from(format!("line {} of {}\n", n + 1, lines))));
                    });
                },
            );

            let upper = TransformStream::new(&scheduler, StreamConfig::default(), |chunk, _, emit| {
                emit.output(text(&chunk).to_uppercase());
            });

            let sink = SinkStream::new(
                &scheduler,
                StreamConfig::default().high_water_mark(16),
                |_, chunk, _, done| {
                    tracing::info!(line = text(&chunk).trim_end(), "sink");
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        done(Ok(()));
                    });
                },
            );

            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = std::cell::RefCell::new(Some(tx));
            sink.on_event(chunkflow::events::FINISH, move |_| {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(());
                }
            });
            sink.on_error(|err| tracing::warn!(error = %err, "sink failed"));

            source.pipe(&upper).pipe(&sink);
            let _ = rx.await;

            let stats = sink.stats();
            tracing::info!(
                chunks = stats.chunks_written,
                bytes = stats.units_written,
                drains = stats.drains,
                "pipeline finished"
            );
        }))
        .await;

    Ok(())
}
