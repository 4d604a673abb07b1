//! IPC protocol types using rkyv for zero-copy serialization
//!
//! Frames are `[4-byte length (little-endian)][rkyv bytes]`. Identities cross
//! the wire in their flattened `package/component` form.

use std::str::FromStr;

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HostError, Result};
use crate::extension::{ClickAction, ExtensionIdentity, ExtensionListing, StatusPayload};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// IPC request from a client to the host
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check if the host is alive
    Ping,
    /// Stop the host
    Shutdown,
    /// Installed extensions with their active flag
    ListExtensions { world_readable_only: bool },
    GetStatus { identity: String },
    /// Collapsed `refresh(MANUAL)` for the given identities, or all active ones
    RequestUpdate { identities: Option<Vec<String>> },
    /// Replaces the connection's interest set; keeps the connection open
    Subscribe { identities: Vec<String> },
    ShowSettings { identity: String },
    /// Uncollapsed refresh with a reason code, for one identity or all active ones
    UpdateExtensions {
        identity: Option<String>,
        reason: u8,
    },
    /// Platform screen-on event
    ScreenOn,
    /// Packages were installed, removed or replaced
    PackagesChanged { package: Option<String> },
    /// Supervisor diagnostics
    ListSessions,
}

/// IPC response or subscription event from the host
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Pong { uptime_secs: u64, version: String },
    Ok,
    Error { message: String },
    Accepted { accepted: bool },
    /// `trusted` tells the client whether it sees non-world-readable data
    Extensions {
        list: Vec<ExtensionInfo>,
        trusted: bool,
    },
    /// `None` when the identity is not active
    Status { status: Option<StatusInfo> },
    Sessions { list: Vec<SessionInfo> },
    SettingsEntry { identity: String, entry: String },
    /// Streamed on a subscription
    StatusChanged { identity: String, status: StatusInfo },
    /// Streamed on a subscription; relist everything
    ExtensionsChanged { list: Vec<ExtensionInfo> },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

/// Wire form of an [`ExtensionListing`]
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ExtensionInfo {
    pub identity: String,
    pub title: String,
    pub description: Option<String>,
    pub protocol_version: i32,
    pub compatible: bool,
    pub world_readable: bool,
    pub settings: Option<String>,
    pub active: bool,
}

impl ExtensionInfo {
    pub fn new(listing: &ExtensionListing, active: bool) -> Self {
        Self {
            identity: listing.identity.to_string(),
            title: listing.title.clone(),
            description: listing.description.clone(),
            protocol_version: listing.protocol_version,
            compatible: listing.compatible,
            world_readable: listing.world_readable,
            settings: listing.settings.clone(),
            active,
        }
    }

    pub fn to_listing(&self) -> Result<ExtensionListing> {
        let identity = ExtensionIdentity::from_str(&self.identity)?;
        let mut listing = ExtensionListing::new(identity, self.protocol_version)
            .title(self.title.clone())
            .world_readable(self.world_readable);
        listing.description = self.description.clone();
        listing.settings = self.settings.clone();
        listing.compatible = self.compatible;
        Ok(listing)
    }
}

/// Wire form of a [`StatusPayload`]
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[rkyv(derive(Debug))]
pub struct StatusInfo {
    pub visible: bool,
    pub icon: i32,
    pub icon_uri: Option<String>,
    pub status: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub click_action: Option<String>,
    pub accessibility_text: Option<String>,
}

impl From<&StatusPayload> for StatusInfo {
    fn from(payload: &StatusPayload) -> Self {
        Self {
            visible: payload.visible,
            icon: payload.icon,
            icon_uri: payload.icon_uri.clone(),
            status: payload.status.clone(),
            title: payload.title.clone(),
            body: payload.body.clone(),
            click_action: payload.click_action.as_ref().map(|a| a.as_uri().to_string()),
            accessibility_text: payload.accessibility_text.clone(),
        }
    }
}

impl From<StatusInfo> for StatusPayload {
    fn from(info: StatusInfo) -> Self {
        StatusPayload {
            visible: info.visible,
            icon: info.icon,
            icon_uri: info.icon_uri,
            status: info.status,
            title: info.title,
            body: info.body,
            click_action: info.click_action.map(ClickAction::new),
            accessibility_text: info.accessibility_text,
        }
    }
}

/// One supervisor session, for diagnostics
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct SessionInfo {
    pub identity: String,
    pub state: String,
    pub pending: u64,
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::prefixed(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::prefixed(&bytes))
    }

    fn prefixed(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    pub fn decode_request(bytes: &[u8]) -> Result<Request> {
        Ok(rkyv::from_bytes::<Request, rkyv::rancor::Error>(bytes)?)
    }

    pub fn decode_response(bytes: &[u8]) -> Result<Response> {
        Ok(rkyv::from_bytes::<Response, rkyv::rancor::Error>(bytes)?)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Reads one frame body. `None` on a clean end of stream.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<AlignedVec>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(HostError::Ipc(format!("frame of {len} bytes exceeds limit")));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let mut aligned = AlignedVec::<16>::with_capacity(len);
        aligned.extend_from_slice(&body);
        Ok(Some(aligned))
    }

    pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
        match Self::read_frame(reader).await? {
            Some(body) => Self::decode_request(&body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Response>> {
        match Self::read_frame(reader).await? {
            Some(body) => Self::decode_response(&body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, request: &Request) -> Result<()> {
        Self::write_frame(writer, &Self::encode_request(request)?).await
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(
        writer: &mut W,
        response: &Response,
    ) -> Result<()> {
        Self::write_frame(writer, &Self::encode_response(response)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_access() {
        let request = Request::Ping;
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&request).unwrap();
        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&bytes).unwrap();
        assert!(matches!(archived, ArchivedRequest::Ping));
    }

    #[test]
    fn test_pong_access() {
        let response = Response::Pong {
            uptime_secs: 3600,
            version: "0.3.0".to_string(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&response).unwrap();
        let archived = rkyv::access::<ArchivedResponse, rkyv::rancor::Error>(&bytes).unwrap();

        if let ArchivedResponse::Pong {
            uptime_secs,
            version,
        } = archived
        {
            assert_eq!(*uptime_secs, 3600);
            assert_eq!(version.as_str(), "0.3.0");
        } else {
            panic!("Expected Pong response");
        }
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = Request::Subscribe {
            identities: vec!["com.example/Weather".into(), "com.example/Mail".into()],
        };
        MessageFrame::write_request(&mut client, &request).await.unwrap();
        MessageFrame::write_request(&mut client, &Request::ListSessions)
            .await
            .unwrap();
        drop(client);

        assert_eq!(
            MessageFrame::read_request(&mut server).await.unwrap(),
            Some(request)
        );
        assert_eq!(
            MessageFrame::read_request(&mut server).await.unwrap(),
            Some(Request::ListSessions)
        );
        assert_eq!(MessageFrame::read_request(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();
        let err = MessageFrame::read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.slug(), "ipc");
    }

    #[test]
    fn status_info_keeps_click_action() {
        let payload = StatusPayload::visible("12°")
            .with_title("Sunny")
            .with_click_action(ClickAction::new("https://weather.example"));
        let info = StatusInfo::from(&payload);
        assert_eq!(info.click_action.as_deref(), Some("https://weather.example"));
        assert_eq!(StatusPayload::from(info), payload);
    }

    #[test]
    fn extension_info_to_listing() {
        let identity = ExtensionIdentity::new("com.example", ".Weather");
        let mut listing = ExtensionListing::new(identity.clone(), 2)
            .title("Weather")
            .world_readable(true)
            .settings(".Settings");
        listing.compatible = true;

        let info = ExtensionInfo::new(&listing, true);
        assert_eq!(info.identity, "com.example/com.example.Weather");
        assert!(info.active);
        assert_eq!(info.to_listing().unwrap(), listing);

        let broken = ExtensionInfo {
            identity: "no-slash".into(),
            ..info
        };
        assert!(broken.to_listing().is_err());
    }
}
