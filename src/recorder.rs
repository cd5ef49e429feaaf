// ===============================
// src/recorder.rs
// ===============================
//
// JSONL journal of feed status, account frames, statistics and coordination
// signals:
// - one `Event` per line, appended
// - BufWriter, flushed every second and every 500 events
// - parent directory created on demand
// - a failed write reopens the file once, then drops the event
//
// Enabled with `RECORD_FILE=/path/to/events.jsonl`.
//
use chrono::Utc;
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 500;

#[derive(serde::Serialize)]
struct Line<'a> {
    ts_ms: i64,
    #[serde(flatten)]
    event: &'a Event,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

fn encode(ev: &Event) -> Option<Vec<u8>> {
    let line = Line { ts_ms: Utc::now().timestamp_millis(), event: ev };
    match serde_json::to_vec(&line) {
        Ok(mut v) => {
            v.push(b'\n');
            Some(v)
        }
        Err(e) => {
            error!(?e, "recorder: serialize error, skip event");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let Some(bytes) = encode(&ev) else { continue };

                if let Err(e) = writer.write_all(&bytes).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    writer = match open_writer(&path).await {
                        Ok(w) => w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, recording stopped");
                            return;
                        }
                    };
                    if let Err(e2) = writer.write_all(&bytes).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnState, StatusKind, StatusUpdate};

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = std::env::temp_dir().join(format!("mt5_sync-recorder-{}", std::process::id()));
        let path = dir.join("events.jsonl").display().to_string();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path.clone()));

        tx.send(Event::Note("boot".into())).await.unwrap();
        tx.send(Event::Status(StatusUpdate {
            state: ConnState::Connected,
            attempts: 0,
            kind: StatusKind::Connected,
        }))
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["Note"], "boot");
        assert!(lines[1]["ts_ms"].as_i64().unwrap() > 0);
        assert_eq!(lines[1]["Status"]["state"], "Connected");
        let _ = std::fs::remove_dir_all(dir);
    }
}
