use std::io::{Chain, Cursor, Read};

/// Pairs of bytes scanned for the start of the `data` chunk tag.
const MAX_PAIRS: usize = 30;

/// Skip a RIFF/WAV header by looking for the `data` chunk, without checking
/// the format fields.
///
/// Returns whether a chunk tag turned up, and the input positioned at the
/// samples. Without a tag the scanned bytes are replayed ahead of the rest,
/// so the input reads back unchanged.
pub fn skip_header<R: Read>(mut input: R) -> std::io::Result<(bool, Chain<Cursor<Vec<u8>>, R>)> {
    let mut scanned = Vec::with_capacity(MAX_PAIRS * 2);
    for _ in 0..MAX_PAIRS {
        let start = scanned.len();
        if input.by_ref().take(2).read_to_end(&mut scanned)? < 2 {
            break;
        }
        if &scanned[start..] == b"da" {
            // "ta" and the 32-bit chunk size
            let mut rest = [0u8; 6];
            input.read_exact(&mut rest)?;
            return Ok((true, Cursor::new(Vec::new()).chain(input)));
        }
    }
    Ok((false, Cursor::new(scanned).chain(input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_header(data_len: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&(36 + data_len).to_le_bytes());
        h.extend_from_slice(b"WAVEfmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&2u16.to_le_bytes());
        h.extend_from_slice(&44100u32.to_le_bytes());
        h.extend_from_slice(&(44100u32 * 4).to_le_bytes());
        h.extend_from_slice(&4u16.to_le_bytes());
        h.extend_from_slice(&16u16.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&data_len.to_le_bytes());
        h
    }

    #[test]
    fn test_skips_canonical_header() -> anyhow::Result<()> {
        let mut bytes = wav_header(4);
        assert_eq!(bytes.len(), 44);
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let (found, mut input) = skip_header(Cursor::new(bytes))?;
        assert!(found);
        assert_eq!(input.get_ref().1.position(), 44);

        let mut rest = Vec::new();
        input.read_to_end(&mut rest)?;
        assert_eq!(rest, [1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_no_data_chunk_keeps_input() -> anyhow::Result<()> {
        let pcm: Vec<u8> = (0..100u8).collect();
        let (found, mut input) = skip_header(Cursor::new(pcm.clone()))?;
        assert!(!found);
        let mut replayed = Vec::new();
        input.read_to_end(&mut replayed)?;
        assert_eq!(replayed, pcm);

        for short in [&b"RIFF"[..], &b"RIF"[..], &[][..]] {
            let (found, mut input) = skip_header(Cursor::new(short.to_vec()))?;
            assert!(!found);
            let mut replayed = Vec::new();
            input.read_to_end(&mut replayed)?;
            assert_eq!(replayed, short);
        }
        Ok(())
    }
}
