//! Unix-socket control interface.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. Each
//! request gets exactly one reply; a client that sent `subscribe` also
//! receives interleaved notification frames. Replies carry `"type":"reply"`
//! and notifications `"type":"notification"` so clients can split the two
//! streams.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use usbwarden_core::{DecisionMode, DecisionOutcome, DeviceId, DeviceInfo, Notification};

use crate::bridge::CoordinatorHandle;
use crate::coordinator::{PendingDevice, StatusReport};
use crate::whitelist::WhitelistEntry;

/// Upper bound on one frame's payload. Nothing in this protocol comes
/// close; anything larger is a broken or hostile client.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Client-to-daemon request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Decide a pending device. `code` may be empty for `deny`.
    Decide {
        device_id: DeviceId,
        #[serde(default)]
        code: String,
        mode: DecisionMode,
        #[serde(default)]
        remember: bool,
    },
    SetEnabled {
        enabled: bool,
    },
    SetTimeout {
        seconds: u64,
    },
    Status,
    ListPending,
    WhitelistAdd {
        device: DeviceInfo,
        #[serde(default)]
        notes: Option<String>,
    },
    WhitelistRemove {
        serial_number: String,
    },
    WhitelistList,
    Subscribe,
}

/// Daemon-to-client reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Decision { outcome: DecisionOutcome },
    Ack { ok: bool },
    Timeout { seconds: u64 },
    Status { status: StatusReport },
    Pending { devices: Vec<PendingDevice> },
    Whitelist { entries: Vec<WhitelistEntry> },
    Subscribed,
    Error { message: String },
}

/// Everything the daemon writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply {
        #[serde(flatten)]
        reply: Reply,
    },
    Notification {
        #[serde(flatten)]
        notification: Notification,
    },
}

/// Bind the control socket, replacing a stale one from a previous run.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    // World-accessible on purpose: connecting grants nothing, every grant
    // requires a valid code.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

/// Accept loop. Runs until the task is dropped.
pub async fn serve(listener: UnixListener, handle: CoordinatorHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, handle).await {
                        tracing::debug!(%err, "client connection ended with error");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: CoordinatorHandle) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    // All outbound frames go through one channel so replies and
    // notifications never interleave mid-frame.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(32);
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write_frame(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    let mut subscription: Option<JoinHandle<()>> = None;
    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        let reply = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => dispatch(&handle, request, &out_tx, &mut subscription).await,
            Err(err) => Reply::Error {
                message: format!("malformed request: {err}"),
            },
        };
        if out_tx.send(ServerMessage::Reply { reply }).await.is_err() {
            break Ok(());
        }
    };

    if let Some(task) = subscription {
        task.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;
    result
}

async fn dispatch(
    handle: &CoordinatorHandle,
    request: Request,
    out_tx: &mpsc::Sender<ServerMessage>,
    subscription: &mut Option<JoinHandle<()>>,
) -> Reply {
    match request {
        Request::Decide {
            device_id,
            code,
            mode,
            remember,
        } => Reply::Decision {
            outcome: handle.decide(device_id, code, mode, remember).await,
        },
        Request::SetEnabled { enabled } => Reply::Ack {
            ok: handle.set_enabled(enabled).await,
        },
        Request::SetTimeout { seconds } => match handle.set_timeout(seconds).await {
            Some(seconds) => Reply::Timeout { seconds },
            None => Reply::Error {
                message: "could not persist timeout".into(),
            },
        },
        Request::Status => match handle.status().await {
            Some(status) => Reply::Status { status },
            None => Reply::Error {
                message: "daemon is shutting down".into(),
            },
        },
        Request::ListPending => Reply::Pending {
            devices: handle.list_pending().await,
        },
        Request::WhitelistAdd { device, notes } => Reply::Ack {
            ok: handle.whitelist_add(device, notes).await,
        },
        Request::WhitelistRemove { serial_number } => Reply::Ack {
            ok: handle.whitelist_remove(serial_number).await,
        },
        Request::WhitelistList => Reply::Whitelist {
            entries: handle.whitelist_list().await,
        },
        Request::Subscribe => {
            if subscription.is_none() {
                let mut events = handle.subscribe();
                let out = out_tx.clone();
                *subscription = Some(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(notification) => {
                                let message = ServerMessage::Notification { notification };
                                if out.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "client lagged, notifications dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
            Reply::Subscribed
        }
    }
}

/// Read one length-delimited frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize and write one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds size limit",
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::SetTimeout { seconds: 60 };
        write_frame(&mut client, &request).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        let parsed: Request = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed, request);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn request_wire_shape() {
        let json = r#"{"op":"decide","device_id":"1-4","code":"123456","mode":"full"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            Request::Decide {
                device_id: DeviceId::parse("1-4").unwrap(),
                code: "123456".into(),
                mode: DecisionMode::Full,
                remember: false,
            }
        );
    }

    #[test]
    fn deny_needs_no_code() {
        let json = r#"{"op":"decide","device_id":"1-4","mode":"deny"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(
            request,
            Request::Decide { code, mode: DecisionMode::Deny, .. } if code.is_empty()
        ));
    }

    #[test]
    fn server_message_tagging() {
        let message = ServerMessage::Reply {
            reply: Reply::Decision {
                outcome: DecisionOutcome::Success,
            },
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"reply""#));
        assert!(json.contains(r#""result":"decision""#));
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);

        let message = ServerMessage::Notification {
            notification: Notification::ProtectionStateChanged { enabled: false },
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"notification""#));
        assert!(json.contains(r#""event":"protection_state_changed""#));
    }

    #[test]
    fn malformed_device_id_rejected_at_parse() {
        let json = r#"{"op":"decide","device_id":"../1-4","mode":"deny"}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }
}
