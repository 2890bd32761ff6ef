//! One-shot `ask` flow: create a task, enqueue the input, stream events
//! to the terminal until the executor reaches a resting state.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use tandem_core::bus::{topics, BusEvent, BusPayload, Handler};
use tandem_core::{ErrorKind, Input, Manager, ManagerHandle, TaskState};

pub async fn run(manager: Arc<Manager>, text: &str, agent: &str, workdir: &Path) -> Result<()> {
    let task = manager.init_task("cli task", None, &workdir.display().to_string())?;
    let bus = manager.bus();

    let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
    let handler: Handler = Arc::new(move |event: BusEvent| {
        let _ = tx.send(event);
    });
    for topic in [
        topics::STREAM,
        topics::CONTROL,
        topics::ERRORS,
        topics::COMPLETE,
    ] {
        bus.listen(topic, Arc::clone(&handler));
    }

    manager
        .handle(Input::user(text), &task.uuid, agent)
        .await?;

    let mut streamed = false;
    let mut resting = false;
    loop {
        let event = if resting {
            // Terminal state seen; drain whatever deliveries are still in
            // flight (bus fan-out is unordered), then stop.
            match tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await {
                Ok(Some(event)) => event,
                _ => break,
            }
        } else {
            match rx.recv().await {
                Some(event) => event,
                None => break,
            }
        };

        if event.correlation_id != task.uuid {
            continue;
        }
        match event.payload {
            BusPayload::Stream { chunk, .. } => {
                streamed = true;
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            }
            BusPayload::Complete { content, .. } => {
                if streamed {
                    println!();
                    streamed = false;
                }
                println!("{content}");
            }
            BusPayload::Error(error) => {
                eprintln!("error ({:?}): {}", error.kind, error.message);
                // The turn limit parks the task in `waiting`; nothing more
                // will happen without another input.
                if error.kind == ErrorKind::TurnLimit {
                    resting = true;
                }
            }
            // `waiting` is a mid-loop state (tool results pending), so only
            // the genuinely terminal states end the watch.
            BusPayload::Control { state, .. } => match state {
                TaskState::Completed | TaskState::Failed | TaskState::Canceled => {
                    resting = true;
                }
                _ => {}
            },
            _ => {}
        }
    }

    for topic in [
        topics::STREAM,
        topics::CONTROL,
        topics::ERRORS,
        topics::COMPLETE,
    ] {
        bus.remove(topic, &handler);
    }

    manager.shutdown().await;
    Ok(())
}
