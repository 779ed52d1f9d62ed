//! Consistent overhead byte stuffing.
//!
//! Each block starts with a code byte giving the distance to the next zero.
//! A code of `0xFF` marks a full block of 254 bytes with no zero after it.
//! The encoded form never contains a zero, so zero can delimit frames.

use thiserror::Error;

/// Longest run of non-zero bytes a single block can carry
const MAX_BLOCK: u8 = 0xFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CobsError {
    #[error("zero byte inside an encoded frame at offset {0}")]
    ZeroByte(usize),
    #[error("block at offset {offset} runs past the end of the frame")]
    Truncated { offset: usize },
}

/// Encodes `data`, without the trailing frame delimiter
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_idx = 0;
    let mut code = 1u8;
    out.push(0);

    for (i, &b) in data.iter().enumerate() {
        if b == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
            continue;
        }

        out.push(b);
        code += 1;
        // A full block at the very end needs no empty block after it
        if code == MAX_BLOCK && i + 1 < data.len() {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        }
    }

    out[code_idx] = code;
    out
}

/// Decodes one frame, which must not include its delimiter
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == 0 {
            return Err(CobsError::ZeroByte(i));
        }

        let end = i + code as usize;
        if end > data.len() {
            return Err(CobsError::Truncated { offset: i });
        }

        let block = &data[i + 1..end];
        if let Some(pos) = block.iter().position(|b| *b == 0) {
            return Err(CobsError::ZeroByte(i + 1 + pos));
        }
        out.extend_from_slice(block);

        i = end;
        if code < MAX_BLOCK && i < data.len() {
            out.push(0);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(encode(&[]), vec![0x01]);
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(encode(&[0x00, 0x00]), vec![0x01, 0x01, 0x01]);
        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33]), vec![0x03, 0x11, 0x22, 0x02, 0x33]);
        assert_eq!(encode(&[0x11, 0x00, 0x00, 0x00]), vec![0x02, 0x11, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn long_runs_split_into_blocks() {
        let run: Vec<u8> = (1..=254).collect();
        let encoded = encode(&run);
        assert_eq!(encoded.len(), 255);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(decode(&encoded).unwrap(), run);

        let run: Vec<u8> = (0..=255u16).map(|b| (b % 255 + 1) as u8).collect();
        let encoded = encode(&run);
        assert!(!encoded.contains(&0));
        assert_eq!(decode(&encoded).unwrap(), run);
    }

    #[test]
    fn decoded_frames_match_inputs() {
        let samples: [&[u8]; 5] = [b"sout hello", &[0, 0, 0], b"serr\x00\x01\x00", &[0xFF; 600], &[]];
        for sample in samples {
            let encoded = encode(sample);
            assert!(!encoded.contains(&0));
            assert_eq!(decode(&encoded).unwrap(), sample);
        }
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(decode(&[0x05, 0x01, 0x02]), Err(CobsError::Truncated { offset: 0 }));
        assert_eq!(decode(&[0x02, 0x01, 0x00]), Err(CobsError::ZeroByte(2)));
        assert_eq!(decode(&[0x03, 0x00, 0x01]), Err(CobsError::ZeroByte(1)));
    }
}
