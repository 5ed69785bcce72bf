use crate::protocol::Frame;

pub fn frame_to_string(frame: &Frame) -> String {
    match frame {
        Frame::Request { id, payload } => format!("REQUEST  {} ({} bytes)", id, payload.len()),
        Frame::Response { id, payload } => format!("RESPONSE {} ({} bytes)", id, payload.len()),
        Frame::Ping => "PING".to_string(),
        Frame::Pong => "PONG".to_string(),
        Frame::Cancel { id } => format!("CANCEL   {}", id),
        Frame::Shutdown { token } => format!("SHUTDOWN ({} byte token)", token.len()),
    }
}
