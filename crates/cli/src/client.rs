//! Blocking JSONL client for the session protocol.
//!
//! Connects, authenticates, and exposes request/response helpers. Commit
//! broadcasts can arrive between a request and its response; those are
//! buffered and retrievable with [`SessionClient::take_events`].

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use dealgrid_protocol::{
    ClientMessage, ErrorMessage, FetchRowsMessage, HelloMessage, JoinMessage, JoinedMessage,
    LeaveMessage, MutateRowMessage, RowCommittedMessage, RowData, RowRejectedMessage,
    RowsMessage, ServerMessage, PROTOCOL_VERSION,
};

/// Outcome of a mutation submitted through [`SessionClient::mutate`].
#[derive(Debug)]
pub enum MutationResult {
    Committed(RowCommittedMessage),
    Rejected(RowRejectedMessage),
}

/// Client-side session error.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    /// Server closed the connection.
    Closed,
    /// Unexpected or unparseable message.
    Protocol(String),
    /// Error response from the server.
    Server(ErrorMessage),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "connection error: {}", e),
            SessionError::Closed => write!(f, "server closed the connection"),
            SessionError::Protocol(what) => write!(f, "protocol error: {}", what),
            SessionError::Server(e) => write!(f, "server error [{}]: {}", e.code, e.message),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// A connected, authenticated protocol session.
pub struct SessionClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    /// Verified actor id the server bound this session to.
    pub actor: String,
    pub session_id: String,
    next_id: u64,
    pending_events: VecDeque<RowCommittedMessage>,
}

impl SessionClient {
    /// Connect and authenticate.
    pub fn connect(addr: &str, token: &str) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut client = Self {
            stream,
            reader,
            actor: String::new(),
            session_id: String::new(),
            next_id: 1,
            pending_events: VecDeque::new(),
        };

        let id = client.take_id();
        client.send(&ClientMessage::Hello(HelloMessage {
            id,
            client: "dealgrid-cli".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            token: token.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }))?;

        match client.recv()? {
            ServerMessage::Welcome(welcome) => {
                client.actor = welcome.actor;
                client.session_id = welcome.session_id;
                Ok(client)
            }
            ServerMessage::Error(e) => Err(SessionError::Server(e)),
            other => Err(unexpected(&other)),
        }
    }

    /// Disable the read timeout (for `watch`-style streaming).
    pub fn set_blocking_reads(&self) -> Result<(), SessionError> {
        self.stream.set_read_timeout(None)?;
        Ok(())
    }

    /// Join a spreadsheet and start receiving its commit broadcasts.
    pub fn join(&mut self, spreadsheet_id: &str) -> Result<JoinedMessage, SessionError> {
        let id = self.take_id();
        self.send(&ClientMessage::Join(JoinMessage {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.to_string(),
        }))?;
        loop {
            match self.recv()? {
                ServerMessage::Joined(joined) if joined.id == id => return Ok(joined),
                ServerMessage::RowCommitted(event) => self.pending_events.push_back(event),
                ServerMessage::Error(e) if e.id.as_deref() == Some(&id) => {
                    return Err(SessionError::Server(e))
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Leave a spreadsheet (stop receiving its broadcasts).
    pub fn leave(&mut self, spreadsheet_id: &str) -> Result<(), SessionError> {
        let id = self.take_id();
        self.send(&ClientMessage::Leave(LeaveMessage {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.to_string(),
        }))?;
        loop {
            match self.recv()? {
                ServerMessage::Left(left) if left.id == id => return Ok(()),
                ServerMessage::RowCommitted(event) => self.pending_events.push_back(event),
                ServerMessage::Error(e) if e.id.as_deref() == Some(&id) => {
                    return Err(SessionError::Server(e))
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Fetch the full current state of a spreadsheet.
    pub fn fetch_rows(&mut self, spreadsheet_id: &str) -> Result<RowsMessage, SessionError> {
        let id = self.take_id();
        self.send(&ClientMessage::FetchRows(FetchRowsMessage {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.to_string(),
        }))?;
        loop {
            match self.recv()? {
                ServerMessage::Rows(rows) if rows.id == id => return Ok(rows),
                ServerMessage::RowCommitted(event) => self.pending_events.push_back(event),
                ServerMessage::Error(e) if e.id.as_deref() == Some(&id) => {
                    return Err(SessionError::Server(e))
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Submit a row mutation and wait for its outcome.
    ///
    /// The session must be joined to the spreadsheet: a successful commit is
    /// answered through the broadcast (matched on row id + our actor id),
    /// a rejection directly with the request id.
    pub fn mutate(
        &mut self,
        spreadsheet_id: &str,
        row_id: &str,
        expected_version: u64,
        row_data: Option<RowData>,
    ) -> Result<MutationResult, SessionError> {
        let id = self.take_id();
        self.send(&ClientMessage::MutateRow(MutateRowMessage {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.to_string(),
            row_id: row_id.to_string(),
            expected_version,
            row_data,
        }))?;
        loop {
            match self.recv()? {
                ServerMessage::RowCommitted(event)
                    if event.row_id == row_id && event.actor == self.actor =>
                {
                    return Ok(MutationResult::Committed(event))
                }
                ServerMessage::RowCommitted(event) => self.pending_events.push_back(event),
                ServerMessage::RowRejected(rejected) if rejected.id == id => {
                    return Ok(MutationResult::Rejected(rejected))
                }
                ServerMessage::Error(e) if e.id.as_deref() == Some(&id) => {
                    return Err(SessionError::Server(e))
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Next commit broadcast: buffered first, then from the wire.
    pub fn next_event(&mut self) -> Result<RowCommittedMessage, SessionError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.recv()? {
                ServerMessage::RowCommitted(event) => return Ok(event),
                ServerMessage::Error(e) => return Err(SessionError::Server(e)),
                // Ignore stray responses (e.g. a late pong)
                _ => continue,
            }
        }
    }

    /// Buffered broadcasts collected while waiting for responses.
    pub fn take_events(&mut self) -> Vec<RowCommittedMessage> {
        self.pending_events.drain(..).collect()
    }

    fn take_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    fn send(&mut self, msg: &ClientMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| SessionError::Protocol(format!("serialize: {}", e)))?;
        writeln!(self.stream, "{}", json)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<ServerMessage, SessionError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(SessionError::Closed);
        }
        serde_json::from_str(&line).map_err(|e| SessionError::Protocol(format!("parse: {}", e)))
    }
}

fn unexpected(msg: &ServerMessage) -> SessionError {
    SessionError::Protocol(format!("unexpected message: {:?}", msg))
}
