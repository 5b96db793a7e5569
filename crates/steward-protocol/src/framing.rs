//! Multipart framing over a byte stream.
//!
//! One frame carries one or more opaque parts:
//!
//! ```text
//! +-----------+----------------+---------+----------------+---------+
//! | parts (1) | len 0 (4 BE)   | part 0  | len 1 (4 BE)   | part 1  | ...
//! +-----------+----------------+---------+----------------+---------+
//! ```
//!
//! Parts may be empty; a frame may not. Each part is limited to
//! [`MAX_MESSAGE_SIZE`] bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// The parts of one frame.
pub type Parts = Vec<Vec<u8>>;

/// Encodes parts into a single buffer ready to write.
pub fn encode_frame<P: AsRef<[u8]>>(parts: &[P]) -> ProtocolResult<Vec<u8>> {
    if parts.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    let count = u8::try_from(parts.len()).map_err(|_| ProtocolError::TooManyParts(parts.len()))?;

    let total: usize = parts.iter().map(|p| 4 + p.as_ref().len()).sum();
    let mut buffer = Vec::with_capacity(1 + total);
    buffer.push(count);
    for part in parts {
        let part = part.as_ref();
        let len = check_len(part.len())?;
        buffer.extend_from_slice(&len.to_be_bytes());
        buffer.extend_from_slice(part);
    }
    Ok(buffer)
}

/// Decodes one complete frame from the front of `data`.
///
/// Returns the parts and the number of bytes consumed.
pub fn decode_frame(data: &[u8]) -> ProtocolResult<(Parts, usize)> {
    let Some(&count) = data.first() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 1,
            received: 0,
        });
    };
    if count == 0 {
        return Err(ProtocolError::EmptyMessage);
    }

    let mut offset = 1;
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let header = data
            .get(offset..offset + 4)
            .ok_or(ProtocolError::IncompleteMessage {
                expected: offset + 4,
                received: data.len(),
            })?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        offset += 4;
        let end = offset + len as usize;
        let part = data.get(offset..end).ok_or(ProtocolError::IncompleteMessage {
            expected: end,
            received: data.len(),
        })?;
        parts.push(part.to_vec());
        offset = end;
    }
    Ok((parts, offset))
}

fn check_len(len: usize) -> ProtocolResult<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(ProtocolError::MessageTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        }),
    }
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads a single frame.
    ///
    /// Returns `Ok(None)` on a clean EOF before the first byte of a frame. EOF
    /// anywhere else is an error.
    pub async fn read_frame(&mut self) -> ProtocolResult<Option<Parts>> {
        let mut count = [0u8; 1];
        match self.reader.read_exact(&mut count).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if count[0] == 0 {
            return Err(ProtocolError::EmptyMessage);
        }

        let mut parts = Vec::with_capacity(count[0] as usize);
        for _ in 0..count[0] {
            let mut len_buf = [0u8; 4];
            self.reader.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf);
            if len > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::MessageTooLarge {
                    size: len,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            let mut part = vec![0u8; len as usize];
            self.reader.read_exact(&mut part).await?;
            parts.push(part);
        }
        Ok(Some(parts))
    }

    /// Reads a frame that must have exactly `expected` parts.
    pub async fn read_parts(&mut self, expected: usize) -> ProtocolResult<Option<Parts>> {
        match self.read_frame().await? {
            Some(parts) if parts.len() != expected => Err(ProtocolError::PartCount {
                expected,
                received: parts.len(),
            }),
            other => Ok(other),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes and flushes a single frame.
    pub async fn write_frame<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> ProtocolResult<()> {
        let data = encode_frame(parts)?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = encode_frame(&[b"ab".as_slice(), b"".as_slice()]).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0]);
    }

    #[test]
    fn decode_reports_consumed_bytes() {
        let mut bytes = encode_frame(&[b"topic".as_slice(), b"payload".as_slice()]).unwrap();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[9, 9, 9]);

        let (parts, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(parts, vec![b"topic".to_vec(), b"payload".to_vec()]);
        assert_eq!(consumed, frame_len);
    }

    #[test]
    fn empty_frames_are_rejected() {
        let none: [&[u8]; 0] = [];
        assert!(matches!(encode_frame(&none), Err(ProtocolError::EmptyMessage)));
        assert!(matches!(decode_frame(&[0]), Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn too_many_parts() {
        let parts = vec![Vec::<u8>::new(); 256];
        assert!(matches!(
            encode_frame(&parts),
            Err(ProtocolError::TooManyParts(256))
        ));
    }

    #[test]
    fn truncated_frames_are_incomplete() {
        let bytes = encode_frame(&[b"hello".as_slice()]).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::IncompleteMessage { .. })
        ));
        assert!(matches!(
            decode_frame(&bytes[..3]),
            Err(ProtocolError::IncompleteMessage { .. })
        ));
    }

    #[test]
    fn oversized_part_is_rejected() {
        let mut bytes = vec![1];
        bytes.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn reader_and_writer_over_a_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(&[b"one".as_slice()]).await.unwrap();
        writer
            .write_frame(&[b"two".as_slice(), b"parts".as_slice()])
            .await
            .unwrap();
        drop(writer);

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(vec![b"one".to_vec()])
        );
        assert_eq!(
            reader.read_parts(2).await.unwrap(),
            Some(vec![b"two".to_vec(), b"parts".to_vec()])
        );
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reader_enforces_part_count() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(&[b"lonely".as_slice()]).await.unwrap();
        assert!(matches!(
            reader.read_parts(2).await,
            Err(ProtocolError::PartCount {
                expected: 2,
                received: 1
            })
        ));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(&[1, 0, 0, 0, 10, b'x']).await.unwrap();
        drop(client);

        assert!(matches!(reader.read_frame().await, Err(ProtocolError::Io(_))));
    }
}
