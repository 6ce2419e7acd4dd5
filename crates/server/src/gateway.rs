//! TCP session gateway.
//!
//! Binds the configured address and handles JSONL protocol messages, one
//! thread per connection. The gateway owns socket I/O and message dispatch
//! only: permission checks go through the gate, mutations go to the
//! spreadsheet's coordinator, and committed mutations come back through the
//! connection's registry queue.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use uuid::Uuid;

use dealgrid_core::{Column, MutationAction, PermissionLevel, Row};
use dealgrid_protocol::{
    ClientMessage, ColumnKind, ColumnSpec, CommitAction, ErrorMessage, JoinedMessage, LeftMessage,
    PongMessage, ProtocolError, RejectReason, RowCommittedMessage, RowInfo, RowRejectedMessage,
    RowsMessage, ServerMessage, StatsResultMessage, WelcomeMessage, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
use dealgrid_store::Store;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::coordinator::{
    CommittedMutation, CoordinatorError, CoordinatorPool, MutateRequest, MutationReject,
};
use crate::gate::{check_access, GateError};
use crate::metrics::ServerMetrics;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::registry::ConnectionRegistry;

/// Maximum consecutive parse failures before disconnecting a client.
const MAX_PARSE_FAILURES: u32 = 3;

/// The session server: TCP listener plus per-connection handler threads.
pub struct SessionServer {
    listener_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    bound_addr: SocketAddr,
    session_id: Uuid,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

/// Everything a connection handler needs, cheap to clone per connection.
#[derive(Clone)]
struct GatewayContext {
    db_path: PathBuf,
    registry: ConnectionRegistry,
    pool: Arc<CoordinatorPool>,
    metrics: ServerMetrics,
    authenticator: Arc<dyn Authenticator>,
    rate_limiter_config: RateLimiterConfig,
    max_connections: usize,
    session_id: Uuid,
}

impl SessionServer {
    /// Bind the configured address and start accepting connections.
    pub fn start(
        config: &ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let bound_addr = listener.local_addr()?;
        // Non-blocking so the accept loop can observe the shutdown flag
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = ConnectionRegistry::new(config.event_queue_depth);
        let metrics = ServerMetrics::new();
        let pool = Arc::new(CoordinatorPool::new(
            config.db_path.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let session_id = Uuid::new_v4();

        let ctx = GatewayContext {
            db_path: config.db_path.clone(),
            registry: registry.clone(),
            pool,
            metrics: metrics.clone(),
            authenticator,
            rate_limiter_config: config.rate_limiter,
            max_connections: config.max_connections,
            session_id,
        };

        let listener_shutdown = Arc::clone(&shutdown);
        let listener_handle = thread::spawn(move || run_listener(listener, listener_shutdown, ctx));

        log::info!("Session server started on {}", bound_addr);

        Ok(Self {
            listener_handle: Some(listener_handle),
            shutdown,
            bound_addr,
            session_id,
            registry,
            metrics,
        })
    }

    /// Stop accepting connections and join the listener thread. Connection
    /// threads wind down as their sockets close or their clients leave.
    pub fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
        log::info!("Session server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_listener(listener: TcpListener, shutdown: Arc<AtomicBool>, ctx: GatewayContext) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if ctx.registry.connection_count() >= ctx.max_connections {
                    log::warn!(
                        "Connection refused from {}: limit of {} reached",
                        addr,
                        ctx.max_connections
                    );
                    ServerMetrics::bump(&ctx.metrics.connections_refused_limit);
                    drop(stream);
                    continue;
                }

                log::debug!("Accepted connection from {}", addr);
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let (conn_id, event_rx) = ctx.registry.register();
                    let result = handle_connection(stream, conn_id, event_rx, &ctx);
                    // Tears down every subscription; no backlog is kept
                    ctx.registry.disconnect(conn_id);
                    if let Err(e) = result {
                        log::debug!("Connection {} from {} closed: {}", conn_id, addr, e);
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// Handle a single client connection until it closes.
fn handle_connection(
    mut stream: TcpStream,
    conn_id: u64,
    event_rx: Receiver<CommittedMutation>,
    ctx: &GatewayContext,
) -> std::io::Result<()> {
    // Short read timeout so the loop interleaves inbound parsing with
    // outbound event delivery.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    // Read-path store for this connection (columns, rows, permission lookups)
    let store = Store::open(&ctx.db_path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let reader = BufReader::new(stream.try_clone()?);
    let mut lines = reader.lines();
    let mut actor: Option<Uuid> = None;
    let mut rate_limiter = RateLimiter::new(ctx.rate_limiter_config);
    let mut parse_failures: u32 = 0;

    loop {
        // Deliver pending commit broadcasts for joined spreadsheets
        match drain_events(&event_rx) {
            Ok(events) => {
                for event in events {
                    send_message(&mut stream, &ServerMessage::RowCommitted(commit_message(&event)))?;
                }
            }
            Err(EventQueueClosed) => {
                // Evicted by the fanout (queue overflow): hang up so the
                // client rejoins and refetches through the read path.
                log::debug!("Connection {} closing after fanout eviction", conn_id);
                return Ok(());
            }
        }

        // Try to read the next message (with timeout)
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Some(Err(ref e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Some(Err(e)) => return Err(e),
            None => return Ok(()), // Connection closed
        };

        if line.len() > MAX_MESSAGE_SIZE {
            send_error(&mut stream, None, ProtocolError::MessageTooLarge)?;
            log::warn!(
                "Connection {} sent oversized message ({} bytes), disconnecting",
                conn_id,
                line.len()
            );
            ServerMetrics::bump(&ctx.metrics.connections_closed_oversize);
            return Ok(());
        }

        let msg: ClientMessage = match serde_json::from_str(&line) {
            Ok(m) => {
                parse_failures = 0;
                m
            }
            Err(e) => {
                parse_failures += 1;
                log::debug!(
                    "Malformed message ({}/{}): {}",
                    parse_failures,
                    MAX_PARSE_FAILURES,
                    e
                );
                send_error(&mut stream, None, ProtocolError::MalformedMessage)?;
                if parse_failures >= MAX_PARSE_FAILURES {
                    log::warn!(
                        "Connection {} exceeded parse failure limit, disconnecting",
                        conn_id
                    );
                    ServerMetrics::bump(&ctx.metrics.connections_closed_parse_failures);
                    return Ok(());
                }
                continue;
            }
        };

        // First message must be Hello
        let Some(actor_id) = actor else {
            match msg {
                ClientMessage::Hello(hello) => {
                    let Some(user_id) = ctx.authenticator.authenticate(&hello.token) else {
                        send_error(&mut stream, Some(hello.id), ProtocolError::AuthFailed)?;
                        return Ok(());
                    };
                    if hello.protocol_version > PROTOCOL_VERSION {
                        send_error(&mut stream, Some(hello.id), ProtocolError::ProtocolMismatch)?;
                        return Ok(());
                    }
                    actor = Some(user_id);
                    let response = ServerMessage::Welcome(WelcomeMessage {
                        id: hello.id,
                        session_id: ctx.session_id.to_string(),
                        actor: user_id.to_string(),
                        protocol_version: hello.protocol_version.min(PROTOCOL_VERSION),
                        capabilities: vec![
                            "mutate_row".to_string(),
                            "fetch_rows".to_string(),
                            "stats".to_string(),
                        ],
                    });
                    send_message(&mut stream, &response)?;
                }
                _ => {
                    send_error(&mut stream, None, ProtocolError::AuthFailed)?;
                    return Ok(());
                }
            }
            continue;
        };

        if let Some(response) =
            handle_message_with_rate_limit(msg, actor_id, conn_id, &store, ctx, &mut rate_limiter)
        {
            send_message(&mut stream, &response)?;
        }
    }
}

/// Apply per-connection rate limiting, then dispatch.
fn handle_message_with_rate_limit(
    msg: ClientMessage,
    actor: Uuid,
    conn_id: u64,
    store: &Store,
    ctx: &GatewayContext,
    rate_limiter: &mut RateLimiter,
) -> Option<ServerMessage> {
    let request_id = match &msg {
        ClientMessage::Hello(m) => Some(m.id.clone()),
        ClientMessage::Join(m) => Some(m.id.clone()),
        ClientMessage::Leave(m) => Some(m.id.clone()),
        ClientMessage::MutateRow(m) => Some(m.id.clone()),
        ClientMessage::FetchRows(m) => Some(m.id.clone()),
        ClientMessage::Ping(m) => Some(m.id.clone()),
        ClientMessage::Stats(m) => Some(m.id.clone()),
    };

    let rate_check = match &msg {
        ClientMessage::Hello(_) => Ok(()),
        ClientMessage::Join(_) => rate_limiter.try_join(),
        ClientMessage::Leave(_) => rate_limiter.try_leave(),
        ClientMessage::MutateRow(_) => rate_limiter.try_mutate(),
        ClientMessage::FetchRows(_) => rate_limiter.try_fetch(),
        ClientMessage::Ping(_) => rate_limiter.try_ping(),
        ClientMessage::Stats(_) => rate_limiter.try_ping(),
    };

    if let Err(e) = rate_check {
        log::debug!(
            "Rate limited connection {}: requested={}, available={}, retry_after={}ms",
            conn_id,
            e.requested,
            e.available,
            e.retry_after_ms
        );
        return Some(ServerMessage::Error(ProtocolError::rate_limited_error(
            request_id,
            e.retry_after_ms,
        )));
    }

    handle_message(msg, actor, conn_id, store, ctx)
}

/// Dispatch one authenticated message. Returns the direct response, if any —
/// a successful mutation has none; its broadcast is the success signal.
fn handle_message(
    msg: ClientMessage,
    actor: Uuid,
    conn_id: u64,
    store: &Store,
    ctx: &GatewayContext,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Hello(m) => Some(ServerMessage::Error(
            ProtocolError::AlreadyAuthenticated.to_error_message(Some(m.id)),
        )),

        ClientMessage::Join(m) => {
            let Ok(spreadsheet_id) = Uuid::parse_str(&m.spreadsheet_id) else {
                return Some(ServerMessage::Error(
                    ProtocolError::InvalidId.to_error_message(Some(m.id)),
                ));
            };
            match check_access(store, spreadsheet_id, actor, PermissionLevel::View) {
                Ok(_) => {}
                Err(GateError::Denied) => {
                    ServerMetrics::bump(&ctx.metrics.permission_denials);
                    return Some(ServerMessage::Error(
                        ProtocolError::PermissionDenied.to_error_message(Some(m.id)),
                    ));
                }
                Err(GateError::Store(e)) => return Some(internal_error(Some(m.id), &e.to_string())),
            }
            let columns = match store.list_columns(spreadsheet_id) {
                Ok(columns) => columns,
                Err(e) => return Some(internal_error(Some(m.id), &e.to_string())),
            };
            ctx.registry.subscribe(conn_id, spreadsheet_id);
            Some(ServerMessage::Joined(JoinedMessage {
                id: m.id,
                spreadsheet_id: m.spreadsheet_id,
                columns: columns.iter().map(column_spec).collect(),
            }))
        }

        ClientMessage::Leave(m) => {
            if let Ok(spreadsheet_id) = Uuid::parse_str(&m.spreadsheet_id) {
                ctx.registry.unsubscribe(conn_id, spreadsheet_id);
            }
            Some(ServerMessage::Left(LeftMessage {
                id: m.id,
                spreadsheet_id: m.spreadsheet_id,
            }))
        }

        ClientMessage::MutateRow(m) => {
            let (Ok(spreadsheet_id), Ok(row_id)) =
                (Uuid::parse_str(&m.spreadsheet_id), Uuid::parse_str(&m.row_id))
            else {
                return Some(ServerMessage::Error(
                    ProtocolError::InvalidId.to_error_message(Some(m.id)),
                ));
            };

            // Gate before validation and before the coordinator: denied
            // requests cost nothing downstream and leak nothing back.
            match check_access(store, spreadsheet_id, actor, PermissionLevel::Edit) {
                Ok(_) => {}
                Err(GateError::Denied) => {
                    ServerMetrics::bump(&ctx.metrics.permission_denials);
                    return Some(reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::PermissionError,
                        None,
                        None,
                    ));
                }
                Err(GateError::Store(e)) => {
                    log::warn!("Permission lookup failed: {}", e);
                    return Some(reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::PersistenceError,
                        None,
                        None,
                    ));
                }
            }

            let handle = match ctx.pool.handle(spreadsheet_id) {
                Ok(handle) => handle,
                Err(e) => {
                    log::warn!("Could not reach coordinator for {}: {}", spreadsheet_id, e);
                    return Some(reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::PersistenceError,
                        None,
                        None,
                    ));
                }
            };

            let outcome = handle.mutate(MutateRequest {
                row_id,
                expected_version: m.expected_version,
                delta: m.row_data,
                actor,
            });

            match outcome {
                // Committed: the broadcast is the originator's answer
                Ok(Ok(_)) => None,
                Ok(Err(reject)) => Some(match reject {
                    MutationReject::Validation(errors) => reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::ValidationError {
                            errors: errors
                                .into_iter()
                                .map(|e| dealgrid_protocol::FieldError {
                                    field: e.field,
                                    message: e.message,
                                })
                                .collect(),
                        },
                        None,
                        None,
                    ),
                    MutationReject::Conflict {
                        current_version,
                        current_row_data,
                    } => reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::ConflictError,
                        Some(current_version),
                        current_row_data,
                    ),
                    MutationReject::Persistence(_) => reject_message(
                        m.id,
                        m.spreadsheet_id,
                        m.row_id,
                        RejectReason::PersistenceError,
                        None,
                        None,
                    ),
                }),
                Err(CoordinatorError::ChannelClosed) => {
                    Some(internal_error(Some(m.id), "coordinator unavailable"))
                }
            }
        }

        ClientMessage::FetchRows(m) => {
            let Ok(spreadsheet_id) = Uuid::parse_str(&m.spreadsheet_id) else {
                return Some(ServerMessage::Error(
                    ProtocolError::InvalidId.to_error_message(Some(m.id)),
                ));
            };
            match check_access(store, spreadsheet_id, actor, PermissionLevel::View) {
                Ok(_) => {}
                Err(GateError::Denied) => {
                    ServerMetrics::bump(&ctx.metrics.permission_denials);
                    return Some(ServerMessage::Error(
                        ProtocolError::PermissionDenied.to_error_message(Some(m.id)),
                    ));
                }
                Err(GateError::Store(e)) => return Some(internal_error(Some(m.id), &e.to_string())),
            }
            let columns = match store.list_columns(spreadsheet_id) {
                Ok(columns) => columns,
                Err(e) => return Some(internal_error(Some(m.id), &e.to_string())),
            };
            let rows = match store.list_rows(spreadsheet_id) {
                Ok(rows) => rows,
                Err(e) => return Some(internal_error(Some(m.id), &e.to_string())),
            };
            Some(ServerMessage::Rows(RowsMessage {
                id: m.id,
                spreadsheet_id: m.spreadsheet_id,
                columns: columns.iter().map(column_spec).collect(),
                rows: rows.into_iter().map(row_info).collect(),
            }))
        }

        ClientMessage::Ping(m) => Some(ServerMessage::Pong(PongMessage { id: m.id })),

        ClientMessage::Stats(m) => Some(ServerMessage::StatsResult(StatsResultMessage {
            id: m.id,
            active_connections: ctx.registry.connection_count() as u64,
            committed_mutations: ServerMetrics::read(&ctx.metrics.committed_mutations),
            conflict_rejections: ServerMetrics::read(&ctx.metrics.conflict_rejections),
            validation_rejections: ServerMetrics::read(&ctx.metrics.validation_rejections),
            permission_denials: ServerMetrics::read(&ctx.metrics.permission_denials),
            overflow_disconnects: ctx.registry.overflow_disconnects(),
            connections_closed_parse_failures: ServerMetrics::read(
                &ctx.metrics.connections_closed_parse_failures,
            ),
            connections_closed_oversize: ServerMetrics::read(
                &ctx.metrics.connections_closed_oversize,
            ),
            connections_refused_limit: ServerMetrics::read(&ctx.metrics.connections_refused_limit),
        })),
    }
}

// ============================================================================
// Wire conversions
// ============================================================================

fn column_spec(column: &Column) -> ColumnSpec {
    use dealgrid_core::ColumnType;
    let kind = match &column.kind {
        ColumnType::Text { max_length } => ColumnKind::Text {
            max_length: *max_length,
        },
        ColumnType::Number { min, max } => ColumnKind::Number {
            min: *min,
            max: *max,
        },
        ColumnType::Currency { min, max } => ColumnKind::Currency {
            min: *min,
            max: *max,
        },
        ColumnType::Date => ColumnKind::Date,
        ColumnType::Boolean => ColumnKind::Boolean,
        ColumnType::Select { options } => ColumnKind::Select {
            options: options.clone(),
        },
    };
    ColumnSpec {
        id: column.id.to_string(),
        name: column.name.clone(),
        kind,
        position: column.position,
        required: column.required,
    }
}

fn commit_message(event: &CommittedMutation) -> RowCommittedMessage {
    RowCommittedMessage {
        spreadsheet_id: event.spreadsheet_id.to_string(),
        row_id: event.row_id.to_string(),
        version: event.version,
        row_data: event.row_data.clone(),
        action: match event.action {
            MutationAction::Insert => CommitAction::Insert,
            MutationAction::Update => CommitAction::Update,
            MutationAction::Delete => CommitAction::Delete,
        },
        actor: event.actor.to_string(),
        timestamp: event.timestamp.to_rfc3339(),
    }
}

fn row_info(row: Row) -> RowInfo {
    RowInfo {
        row_id: row.id.to_string(),
        position: row.position,
        version: row.version,
        row_data: row.row_data,
        updated_by: row.updated_by.to_string(),
        updated_at: row.updated_at.to_rfc3339(),
    }
}

fn reject_message(
    id: String,
    spreadsheet_id: String,
    row_id: String,
    reason: RejectReason,
    current_version: Option<u64>,
    current_row_data: Option<dealgrid_protocol::RowData>,
) -> ServerMessage {
    ServerMessage::RowRejected(RowRejectedMessage {
        id,
        spreadsheet_id,
        row_id,
        reason,
        current_version,
        current_row_data,
    })
}

fn internal_error(id: Option<String>, message: &str) -> ServerMessage {
    ServerMessage::Error(ErrorMessage {
        id,
        code: "internal_error".to_string(),
        message: message.to_string(),
        retry_after_ms: None,
    })
}

/// Event queue closed: this session was evicted by the fanout.
struct EventQueueClosed;

/// Collect pending broadcasts without blocking.
fn drain_events(
    rx: &Receiver<CommittedMutation>,
) -> Result<Vec<CommittedMutation>, EventQueueClosed> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) => return Ok(events),
            Err(TryRecvError::Disconnected) => {
                if events.is_empty() {
                    return Err(EventQueueClosed);
                }
                // Deliver what was already queued, close on the next pass
                return Ok(events);
            }
        }
    }
}

fn send_message(stream: &mut TcpStream, msg: &ServerMessage) -> std::io::Result<()> {
    let json = serde_json::to_string(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(stream, "{}", json)?;
    stream.flush()
}

fn send_error(
    stream: &mut TcpStream,
    id: Option<String>,
    error: ProtocolError,
) -> std::io::Result<()> {
    let msg = ServerMessage::Error(error.to_error_message(id));
    send_message(stream, &msg)
}
