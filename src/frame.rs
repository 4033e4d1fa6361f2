use crate::errors::StreamError;

const DELIMITER: &str = "~m~";
const HEARTBEAT_PREFIX: &str = "~h~";

/// Wraps a payload in the outer wire envelope. The length header counts
/// UTF-8 bytes, not characters.
pub fn encode(payload: &str) -> String {
    format!("{DELIMITER}{}{DELIMITER}{payload}", payload.len())
}

/// True iff the payload is a keep-alive token (`~h~<digits>`).
pub fn is_heartbeat(payload: &str) -> bool {
    payload
        .strip_prefix(HEARTBEAT_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|byte| byte.is_ascii_digit()))
}

/// Splits one websocket message into its framed payloads. Messages usually
/// carry a single frame, but several frames per message are tolerated and a
/// frame never straddles message boundaries.
pub fn split_frames(message: &str) -> Result<Vec<&str>, StreamError> {
    let mut frames = Vec::new();
    let mut rest = message;

    while !rest.is_empty() {
        let Some(after_open) = rest.strip_prefix(DELIMITER) else {
            return Err(StreamError::MalformedFrame(format!(
                "expected `{DELIMITER}` delimiter, got `{}`",
                truncate(rest, 32)
            )));
        };

        let digits = after_open
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits == 0 {
            return Err(StreamError::MalformedFrame(format!(
                "length header is not numeric in `{}`",
                truncate(after_open, 32)
            )));
        }

        let length = after_open[..digits].parse::<usize>().map_err(|err| {
            StreamError::MalformedFrame(format!("length header does not fit: {err}"))
        })?;

        let Some(body) = after_open[digits..].strip_prefix(DELIMITER) else {
            return Err(StreamError::MalformedFrame(format!(
                "missing closing delimiter after length {length}"
            )));
        };

        if body.len() < length || !body.is_char_boundary(length) {
            return Err(StreamError::MalformedFrame(format!(
                "declared length {length} exceeds remaining payload of {} bytes",
                body.len()
            )));
        }

        frames.push(&body[..length]);
        rest = &body[length..];
    }

    Ok(frames)
}

fn truncate(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
