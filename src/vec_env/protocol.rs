//! Messages exchanged between the pool supervisor and its workers.
//!
//! Over process pipes every message travels as a frame: a big-endian `u32`
//! payload length followed by the bincode payload.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::env::StepResult;
use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Info, Space, Tensor};

/// Largest frame a peer may announce
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Request sent by the supervisor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Reset { seed: Option<u64> },
    Step { actions: AgentMap<Tensor> },
    GetAgents,
    GetNumAgents,
    GetSpaces,
    Close,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset { .. } => "reset",
            Command::Step { .. } => "step",
            Command::GetAgents => "get_agents",
            Command::GetNumAgents => "get_num_agents",
            Command::GetSpaces => "get_spaces",
            Command::Close => "close",
        }
    }
}

/// Worker answer to a `Command`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Reset {
        observations: AgentMap<Tensor>,
        info: Info,
    },
    Step(StepResult),
    Agents(Vec<AgentId>),
    NumAgents(usize),
    Spaces {
        observation_spaces: AgentMap<Space>,
        action_spaces: AgentMap<Space>,
    },
    Closed,
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Reset { .. } => "reset",
            Reply::Step(_) => "step",
            Reply::Agents(_) => "agents",
            Reply::NumAgents(_) => "num_agents",
            Reply::Spaces { .. } => "spaces",
            Reply::Closed => "closed",
        }
    }
}

/// Write one length-prefixed frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME_LEN)
        .ok_or_else(|| PallasError::Protocol(format!("frame of {} bytes is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `None` when the peer closed the stream between frames
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(PallasError::Protocol(format!("announced frame of {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| PallasError::Protocol(format!("undecodable frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::scalar;
    use std::io::Cursor;

    #[test]
    fn test_frames_back_to_back() {
        let mut actions = AgentMap::new();
        actions.insert("agent_0".to_string(), scalar(1.0));
        let mut wire = Vec::new();
        write_frame(&mut wire, &Command::Step { actions: actions.clone() }).unwrap();
        write_frame(&mut wire, &Command::Close).unwrap();

        let mut reader = Cursor::new(wire);
        let first: Option<Command> = read_frame(&mut reader).unwrap();
        assert_eq!(first, Some(Command::Step { actions }));
        let second: Option<Command> = read_frame(&mut reader).unwrap();
        assert_eq!(second, Some(Command::Close));
        let end: Option<Command> = read_frame(&mut reader).unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut wire = Vec::new();
        // variant index far outside the command enum
        let payload = 99u32.to_le_bytes();
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(&payload);
        let result: Result<Option<Command>> = read_frame(&mut Cursor::new(wire));
        assert!(matches!(result, Err(PallasError::Protocol(_))));
    }

    #[test]
    fn test_truncated_frame() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&16u32.to_be_bytes());
        wire.extend_from_slice(&[0, 1, 2]);
        let result: Result<Option<Command>> = read_frame(&mut Cursor::new(wire));
        assert!(matches!(result, Err(PallasError::IoError(_))));
    }
}
