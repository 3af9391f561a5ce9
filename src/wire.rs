use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_LINE_LEN, MAX_LISTENS_PER_CONNECTION};
use crate::model::*;
use crate::observability;
use crate::protocol::{parse_request, schedule_key, AppointmentDto, ProtocolError, Reply, Request};
use crate::store::ScheduleAdmin;

/// Pushed replies queued per connection before forwarders start waiting.
const PUSH_BUFFER: usize = 64;

/// Everything a connection needs: the engine for queries and bookings, and
/// the schedule admin for configuration requests.
pub struct Server {
    pub engine: Arc<Engine>,
    pub admin: Arc<dyn ScheduleAdmin>,
}

impl Server {
    pub fn new(engine: Arc<Engine>, admin: Arc<dyn ScheduleAdmin>) -> Self {
        Self { engine, admin }
    }
}

/// Per-connection listen state: one forwarder task per subscribed key.
struct Listens {
    tasks: HashMap<ResourceKey, JoinHandle<()>>,
    push_tx: mpsc::Sender<Reply>,
}

impl Drop for Listens {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Serve one client until it disconnects. Request replies and pushed
/// occupancy changes share the socket, one JSON object per line.
pub async fn process_connection(socket: TcpStream, server: Arc<Server>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (push_tx, mut push_rx) = mpsc::channel(PUSH_BUFFER);
    let mut listens = Listens {
        tasks: HashMap::new(),
        push_tx,
    };

    loop {
        tokio::select! {
            frame = framed.next() => {
                let reply = match frame {
                    None => return Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&server, &line, &mut listens).await,
                    // The codec stream ends after any error; report and hang up.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::protocol_error(&ProtocolError::LineTooLong);
                        framed.send(reply.to_line()).await.map_err(codec_io)?;
                        return Ok(());
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                framed.send(reply.to_line()).await.map_err(codec_io)?;
            }
            Some(push) = push_rx.recv() => {
                framed.send(push.to_line()).await.map_err(codec_io)?;
            }
        }
    }
}

fn codec_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

async fn handle_line(server: &Server, line: &str, listens: &mut Listens) -> Reply {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("rejected request line: {e}");
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                .increment(1);
            return Reply::protocol_error(&e);
        }
    };

    let op = observability::op_label(&request);
    let started = Instant::now();
    let reply = execute(server, request, listens).await;

    let status = if reply.is_error() { "error" } else { "ok" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    reply
}

fn reply_with<T>(result: Result<T, EngineError>, ok: impl FnOnce(T) -> Reply) -> Reply {
    match result {
        Ok(value) => ok(value),
        Err(e) => Reply::error(&e),
    }
}

async fn execute(server: &Server, request: Request, listens: &mut Listens) -> Reply {
    let engine = &server.engine;
    let key = request.key();
    match (request, key) {
        (Request::Availability { .. }, Some(key)) => {
            reply_with(engine.get_availability(&key).await, |view| Reply::availability(&view))
        }
        (Request::Book { start, patient, .. }, Some(key)) => {
            reply_with(engine.book(&key, start, patient).await, |c| Reply::Booked {
                key: c.key,
                appointment: AppointmentDto::from(&c.interval),
            })
        }
        (Request::Cancel { appointment_id, .. }, Some(key)) => {
            reply_with(engine.cancel(&key, appointment_id).await, |removed| Reply::Cancelled {
                key,
                appointment: AppointmentDto::from(&removed),
            })
        }
        (Request::Appointments { .. }, Some(key)) => {
            reply_with(engine.appointments(&key).await, |occupied| Reply::Appointments {
                key,
                appointments: occupied.iter().map(AppointmentDto::from).collect(),
            })
        }
        (Request::Listen { .. }, Some(key)) => match listen(engine, key, listens) {
            Ok(()) => Reply::Listening {
                channel: key.to_string(),
            },
            Err(e) => Reply::protocol_error(&e),
        },
        (Request::Unlisten { .. }, Some(key)) => {
            if let Some(task) = listens.tasks.remove(&key) {
                task.abort();
            }
            Reply::Unlistened {
                channel: key.to_string(),
            }
        }
        (
            Request::SetSchedule {
                professional_id,
                room_id,
                weekday,
                windows,
            },
            _,
        ) => match schedule_key(professional_id, room_id, weekday) {
            Ok(schedule) => {
                let windows: Vec<WorkingWindow> = windows.into_iter().map(WorkingWindow::from).collect();
                reply_with(server.admin.set_schedule(schedule, windows).await, |()| Reply::Ok)
            }
            Err(e) => Reply::protocol_error(&e),
        },
        (
            Request::SetSlotDuration {
                professional_id,
                minutes,
            },
            _,
        ) => reply_with(
            server.admin.set_slot_duration(professional_id, minutes).await,
            |()| Reply::Ok,
        ),
        (_, None) => Reply::protocol_error(&ProtocolError::Invalid("request needs a resource key".into())),
    }
}

/// Idempotent per key. Each key gets a forwarder that turns broadcast
/// changes into pushed lines on this connection.
fn listen(engine: &Engine, key: ResourceKey, listens: &mut Listens) -> Result<(), ProtocolError> {
    if listens.tasks.contains_key(&key) {
        return Ok(());
    }
    if listens.tasks.len() >= MAX_LISTENS_PER_CONNECTION {
        return Err(ProtocolError::TooManyListens);
    }
    let rx = engine.notify.subscribe(key);
    let task = tokio::spawn(forward_changes(key, rx, listens.push_tx.clone()));
    listens.tasks.insert(key, task);
    tracing::debug!("listening on {key}");
    Ok(())
}

async fn forward_changes(
    key: ResourceKey,
    mut rx: broadcast::Receiver<OccupancyChanged>,
    push_tx: mpsc::Sender<Reply>,
) {
    loop {
        let push = match rx.recv().await {
            Ok(change) => Reply::occupancy_changed(&change),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("listener on {key} lagged, {missed} changes dropped");
                metrics::counter!(observability::NOTIFICATIONS_LAGGED_TOTAL).increment(missed);
                Reply::Resync {
                    channel: key.to_string(),
                    missed,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if push_tx.send(push).await.is_err() {
            return;
        }
    }
}
