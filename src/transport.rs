use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::log::{LogDebug, LogInfo, LogWarn};
use crate::log_file::MAX_PAYLOAD;
use crate::replication::ReplicatedLog;

/// One replicated entry travelling leader -> follower. `offset` is the
/// position in the leader's log at which `log_data`'s length prefix sits;
/// the follower accepts it only when it matches its own append position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendLogRequest {
    pub offset: u32,
    pub log_data: Vec<u8>,
}

/// Follower verdict. `offset` is `Some(rewind_to)` when the follower is
/// behind the requested offset (`-1` on the wire, i.e. `None`, when the
/// request is stale and the follower already has those bytes). `current`
/// always carries the follower's append position so a new leader can
/// reconcile after takeover without negotiating.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendLogResponse {
    pub success: bool,
    pub offset: Option<u32>,
    pub current: u32,
}

/// Carrier for the AppendLog RPC. One request in flight at a time from
/// this one leader; the core relies on that to serialize the follower's
/// append handler.
pub trait ReplicaClient: Send + Sync {
    fn append_log(&self, request: &AppendLogRequest) -> io::Result<AppendLogResponse>;

    /// Point the stub at a different peer. Used by takeover; also drops
    /// any cached connection.
    fn rebind(&self, addr: &str);
}

// Wire form, little-endian like the log itself:
//   request  = offset:u32 | len:u32 | payload
//   response = success:u8 | offset:i32 (-1 = stale) | current:u32

pub fn write_request<W: Write>(w: &mut W, request: &AppendLogRequest) -> io::Result<()> {
    w.write_all(&request.offset.to_le_bytes())?;
    w.write_all(&(request.log_data.len() as u32).to_le_bytes())?;
    w.write_all(&request.log_data)?;
    w.flush()
}

pub fn read_request<R: Read>(r: &mut R) -> io::Result<AppendLogRequest> {
    let mut header = [0u8; 8];
    r.read_exact(&mut header)?;
    let offset = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request payload length {} out of range", len),
        ));
    }
    let mut log_data = vec![0u8; len as usize];
    r.read_exact(&mut log_data)?;
    Ok(AppendLogRequest { offset, log_data })
}

pub fn write_response<W: Write>(w: &mut W, response: &AppendLogResponse) -> io::Result<()> {
    let mut buf = [0u8; 9];
    buf[0] = response.success as u8;
    let offset = match response.offset {
        Some(o) => o as i32,
        None => -1,
    };
    buf[1..5].copy_from_slice(&offset.to_le_bytes());
    buf[5..9].copy_from_slice(&response.current.to_le_bytes());
    w.write_all(&buf)?;
    w.flush()
}

pub fn read_response<R: Read>(r: &mut R) -> io::Result<AppendLogResponse> {
    let mut buf = [0u8; 9];
    r.read_exact(&mut buf)?;
    let offset = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok(AppendLogResponse {
        success: buf[0] != 0,
        offset: if offset < 0 { None } else { Some(offset as u32) },
        current: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
    })
}

struct PeerConn {
    addr: String,
    stream: Option<TcpStream>,
}

/// Blocking TCP implementation of `ReplicaClient`. Connects lazily and
/// keeps the connection across calls; any I/O error drops it so the next
/// call reconnects from scratch.
pub struct TcpReplicaClient {
    conn: Mutex<PeerConn>,
    timeout: Duration,
}

impl TcpReplicaClient {
    pub fn new(addr: &str, timeout: Duration) -> TcpReplicaClient {
        TcpReplicaClient {
            conn: Mutex::new(PeerConn {
                addr: addr.to_owned(),
                stream: None,
            }),
            timeout,
        }
    }
}

impl ReplicaClient for TcpReplicaClient {
    fn append_log(&self, request: &AppendLogRequest) -> io::Result<AppendLogResponse> {
        let mut conn = self.conn.lock().unwrap();
        if conn.stream.is_none() {
            let stream = TcpStream::connect(&conn.addr)?;
            stream.set_read_timeout(Some(self.timeout))?;
            stream.set_write_timeout(Some(self.timeout))?;
            stream.set_nodelay(true)?;
            log!(LogDebug, "connected to peer {}", conn.addr);
            conn.stream = Some(stream);
        }
        let stream = conn.stream.as_mut().unwrap();
        let result = write_request(stream, request).and_then(|_| read_response(stream));
        if result.is_err() {
            conn.stream = None;
        }
        result
    }

    fn rebind(&self, addr: &str) {
        let mut conn = self.conn.lock().unwrap();
        log!(LogInfo, "rebinding replication stub {} -> {}", conn.addr, addr);
        conn.addr = addr.to_owned();
        conn.stream = None;
    }
}

/// Accept loop for the follower side of the AppendLog RPC. Each
/// connection gets its own thread; requests on one connection are handled
/// strictly in order, which is the single-in-flight contract the append
/// handler requires from its one leader.
pub fn serve_append_log(listener: TcpListener, core: Arc<ReplicatedLog>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log!(LogWarn, "accept failed: {}", e);
                continue;
            }
        };
        let core = Arc::clone(&core);
        let spawned = thread::Builder::new()
            .name("replog-append".to_owned())
            .spawn(move || serve_connection(stream, core));
        if let Err(e) = spawned {
            log!(LogWarn, "could not spawn append handler thread: {}", e);
        }
    }
}

fn serve_connection(mut stream: TcpStream, core: Arc<ReplicatedLog>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    log!(LogDebug, "append stream from {}", peer);
    loop {
        let request = match read_request(&mut stream) {
            Ok(r) => r,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log!(LogDebug, "append stream from {} closed", peer);
                return;
            }
            Err(e) => {
                log!(LogWarn, "bad append request from {}: {}", peer, e);
                return;
            }
        };
        let response = core.append_log(&request);
        if let Err(e) = write_response(&mut stream, &response) {
            log!(LogWarn, "writing append response to {} failed: {}", peer, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_the_wire_form() {
        let request = AppendLogRequest {
            offset: 1234,
            log_data: b"payload".to_vec(),
        };
        let mut buf = Vec::new();
        write_request(&mut buf, &request).unwrap();
        assert_eq!(buf.len(), 8 + 7);
        let decoded = read_request(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn stale_response_uses_negative_offset_on_the_wire() {
        let response = AppendLogResponse {
            success: false,
            offset: None,
            current: 99,
        };
        let mut buf = Vec::new();
        write_response(&mut buf, &response).unwrap();
        assert_eq!(&buf[1..5], &(-1i32).to_le_bytes());
        let decoded = read_response(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn rewind_response_round_trips() {
        let response = AppendLogResponse {
            success: false,
            offset: Some(40),
            current: 40,
        };
        let mut buf = Vec::new();
        write_response(&mut buf, &response).unwrap();
        assert_eq!(read_response(&mut buf.as_slice()).unwrap(), response);
    }

    #[test]
    fn oversized_request_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&u32::max_value().to_le_bytes());
        assert!(read_request(&mut buf.as_slice()).is_err());
    }
}
