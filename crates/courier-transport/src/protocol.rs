//! Frames this client sends, and heart-beat negotiation.

use std::time::Duration;

use courier_core::SubscriptionId;
use secrecy::{ExposeSecret, SecretString};

use crate::frame::{Command, Frame};

/// Protocol version offered in `CONNECT`.
pub const ACCEPT_VERSION: &str = "1.2";

/// Missed incoming intervals tolerated before the connection is declared dead.
pub const MISSED_BEATS_ALLOWED: u32 = 3;

/// Heart-beat intervals this client offers. `Duration::ZERO` disables a
/// direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often we can send beats.
    pub outgoing: Duration,
    /// How often we want to receive beats.
    pub incoming: Duration,
}

impl HeartbeatConfig {
    /// Both directions disabled.
    pub const DISABLED: Self = Self {
        outgoing: Duration::ZERO,
        incoming: Duration::ZERO,
    };

    /// `heart-beat` header value, `cx,cy` in milliseconds.
    pub fn header_value(&self) -> String {
        format!("{},{}", millis(self.outgoing), millis(self.incoming))
    }

    /// Combine our offer with the server's `heart-beat` header.
    ///
    /// A missing or unparsable header means the server does no heart-beating.
    pub fn negotiate(&self, server_header: Option<&str>) -> NegotiatedHeartbeat {
        let (sx, sy) = server_header.and_then(parse_pair).unwrap_or((0, 0));
        NegotiatedHeartbeat {
            outgoing: combine(millis(self.outgoing), sy),
            incoming: combine(millis(self.incoming), sx),
        }
    }
}

/// Intervals in force for one connection. `None` means that direction is off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiatedHeartbeat {
    /// We send a beat at least this often.
    pub outgoing: Option<Duration>,
    /// The server promised to send something at least this often.
    pub incoming: Option<Duration>,
}

impl NegotiatedHeartbeat {
    /// Silence after which the server is presumed dead.
    pub fn incoming_deadline(&self) -> Option<Duration> {
        self.incoming.map(|d| d * MISSED_BEATS_ALLOWED)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn combine(ours: u64, theirs: u64) -> Option<Duration> {
    (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
}

fn parse_pair(value: &str) -> Option<(u64, u64)> {
    let (x, y) = value.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// `CONNECT` with the bearer token and our heart-beat offer.
pub fn connect_frame(host: &str, token: &SecretString, heartbeat: &HeartbeatConfig) -> Frame {
    Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header(
            "Authorization",
            format!("Bearer {}", token.expose_secret()),
        )
        .header("heart-beat", heartbeat.header_value())
}

/// `SUBSCRIBE` for one topic destination.
pub fn subscribe_frame(id: &SubscriptionId, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id.as_str())
        .header("destination", destination)
        .header("ack", "auto")
}

/// `SEND` of a JSON body.
pub fn send_frame(destination: &str, json_body: &str) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .header("content-type", "application/json")
        .header("content-length", json_body.len().to_string())
        .body(json_body)
}

/// `DISCONNECT`. No receipt is requested since nobody waits for it.
pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}

/// Human-readable reason from an `ERROR` frame.
pub fn error_reason(frame: &Frame) -> String {
    let message = frame.get("message").unwrap_or("unspecified error");
    let detail = frame.body.trim();
    if detail.is_empty() {
        message.to_string()
    } else {
        format!("{message}: {detail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(out_ms: u64, in_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            outgoing: Duration::from_millis(out_ms),
            incoming: Duration::from_millis(in_ms),
        }
    }

    #[test]
    fn header_value_in_millis() {
        assert_eq!(offer(10_000, 5_000).header_value(), "10000,5000");
        assert_eq!(HeartbeatConfig::DISABLED.header_value(), "0,0");
    }

    #[test]
    fn negotiate_takes_larger_interval() {
        let hb = offer(10_000, 10_000).negotiate(Some("4000,20000"));
        // outgoing pairs our cx with their sy, incoming our cy with their sx
        assert_eq!(hb.outgoing, Some(Duration::from_millis(20_000)));
        assert_eq!(hb.incoming, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn zero_on_either_side_disables() {
        let hb = offer(10_000, 0).negotiate(Some("5000,5000"));
        assert_eq!(hb.outgoing, Some(Duration::from_millis(10_000)));
        assert_eq!(hb.incoming, None);

        let hb = offer(10_000, 10_000).negotiate(Some("0,0"));
        assert_eq!(hb, NegotiatedHeartbeat::default());
    }

    #[test]
    fn missing_or_bad_header_disables() {
        assert_eq!(
            offer(1_000, 1_000).negotiate(None),
            NegotiatedHeartbeat::default()
        );
        assert_eq!(
            offer(1_000, 1_000).negotiate(Some("soon")),
            NegotiatedHeartbeat::default()
        );
    }

    #[test]
    fn incoming_deadline_is_three_intervals() {
        let hb = offer(0, 2_000).negotiate(Some("2000,0"));
        assert_eq!(hb.incoming_deadline(), Some(Duration::from_millis(6_000)));
    }

    #[test]
    fn connect_carries_bearer_and_heartbeat() {
        let token = SecretString::from("tok-123".to_string());
        let frame = connect_frame("/", &token, &offer(10_000, 10_000));
        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.get("Authorization"), Some("Bearer tok-123"));
        assert_eq!(frame.get("heart-beat"), Some("10000,10000"));
        assert_eq!(frame.get("accept-version"), Some("1.2"));
    }

    #[test]
    fn send_frame_is_json() {
        let frame = send_frame("/app/chat.send", "{\"a\":1}");
        assert_eq!(frame.get("content-type"), Some("application/json"));
        assert_eq!(frame.get("content-length"), Some("7"));
        assert_eq!(frame.body, "{\"a\":1}");
    }

    #[test]
    fn subscribe_frame_headers() {
        let id = SubscriptionId::from_raw("sub_1");
        let frame = subscribe_frame(&id, "/topic/messages/U1");
        assert_eq!(frame.get("id"), Some("sub_1"));
        assert_eq!(frame.get("destination"), Some("/topic/messages/U1"));
    }

    #[test]
    fn error_reason_joins_message_and_body() {
        let frame = Frame::new(Command::Error)
            .header("message", "auth failed")
            .body("token expired\n");
        assert_eq!(error_reason(&frame), "auth failed: token expired");
        assert_eq!(
            error_reason(&Frame::new(Command::Error)),
            "unspecified error"
        );
    }
}
