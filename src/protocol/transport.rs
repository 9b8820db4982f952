use std::io::{self, Read, Write};

use log::trace;

use crate::{message::Message, schema::Schema};

use super::{
    codec::{decode, encode},
    error::ProtocolError,
};

const HEADER_SIZE: usize = 4;

/// Writes length-prefixed frames to a byte stream.
pub struct MessageWriter<W: Write> {
    stream: W,
    schema: Schema,
    max_frame: usize,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(stream: W, schema: Schema, max_frame: usize) -> Self {
        Self {
            stream,
            schema,
            max_frame: frame_limit(max_frame),
        }
    }

    /// Encodes `message` and writes it as one frame.
    pub fn write(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let payload = encode(&self.schema, message)?;
        trace!("writing {message} ({} bytes)", payload.len());
        self.write_frame(&payload)
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame,
            });
        }
        // max_frame never exceeds u32::MAX, see `frame_limit`.
        let header = (payload.len() as u32).to_be_bytes();
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.stream
    }
}

/// Reads length-prefixed frames from a byte stream.
pub struct MessageReader<R: Read> {
    stream: R,
    schema: Schema,
    max_frame: usize,
}

impl<R: Read> MessageReader<R> {
    pub fn new(stream: R, schema: Schema, max_frame: usize) -> Self {
        Self {
            stream,
            schema,
            max_frame: frame_limit(max_frame),
        }
    }

    /// Blocks until one whole frame has arrived and decodes it.
    pub fn read(&mut self) -> Result<Message, ProtocolError> {
        let payload = self.read_frame()?;
        decode(&self.schema, &payload)
    }

    /// Reads one frame's payload.
    ///
    /// A stream that ends, cleanly or mid-frame, yields [`ProtocolError::SocketClosed`].
    pub fn read_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        read_raw(&mut self.stream, self.max_frame)
    }

    pub fn get_ref(&self) -> &R {
        &self.stream
    }
}

/// Clamps a configured frame limit to what the 4-byte header can express.
pub(crate) fn frame_limit(max_frame: usize) -> usize {
    max_frame.min(u32::MAX as usize)
}

/// Writes one raw frame without a schema; used during the handshake.
pub(crate) fn write_raw<W: Write>(stream: &mut W, payload: &[u8], max: usize) -> io::Result<()> {
    if payload.len() > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "handshake frame too large",
        ));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Reads one raw frame without a schema; used during the handshake.
pub(crate) fn read_raw<R: Read>(stream: &mut R, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;

    let size = u32::from_be_bytes(header) as usize;
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}
