//! RTIME: a simple LZ-style coder used only by JFFS2 (`compr == 2`).

use crate::error::ImageError;

/// Decodes an RTIME-compressed block to exactly `dsize` bytes.
///
/// The coder keeps a 256-entry table of "where this byte value was last emitted", indexed by
/// byte value. Each step emits one literal byte, then optionally a repeat-copy from the
/// position the same byte value was last seen at. When the copy source would overlap the
/// bytes it's writing (`backoff + repeat >= outpos`), it must proceed byte-by-byte rather than
/// as a bulk copy, since each copied byte can depend on one written earlier in the same copy.
pub fn decompress(input: &[u8], dsize: u32) -> Result<Vec<u8>, ImageError> {
    let dsize = dsize as usize;
    let mut positions = [0usize; 256];
    let mut out = vec![0u8; dsize];
    let mut outpos = 0usize;
    let mut inpos = 0usize;

    while outpos < dsize {
        let value = *input.get(inpos).ok_or(ImageError::Format("rtime input truncated"))?;
        inpos += 1;
        out[outpos] = value;
        outpos += 1;

        let repeat = *input.get(inpos).ok_or(ImageError::Format("rtime input truncated"))? as usize;
        inpos += 1;

        let mut backoff = positions[value as usize];
        positions[value as usize] = outpos;

        if repeat > 0 {
            if outpos + repeat > dsize {
                return Err(ImageError::Format("rtime repeat count overruns output size"));
            }
            if backoff + repeat >= outpos {
                for _ in 0..repeat {
                    out[outpos] = out[backoff];
                    outpos += 1;
                    backoff += 1;
                }
            } else {
                out.copy_within(backoff..backoff + repeat, outpos);
                outpos += repeat;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(input: &[(u8, u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (v, r) in input {
            out.push(*v);
            out.push(*r);
        }
        out
    }

    #[test]
    fn literals_only() {
        let input = encode(&[(b'a', 0), (b'b', 0), (b'c', 0)]);
        let out = decompress(&input, 3).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn simple_repeat() {
        // emit 'a', then a self-overlapping repeat of 1 more 'a' copying from the byte just written
        let input = encode(&[(b'a', 0), (b'a', 1)]);
        let out = decompress(&input, 3).unwrap();
        assert_eq!(out, b"aaa");
    }

    #[test]
    fn non_overlapping_repeat() {
        // "ab" then a repeat-2 copy of "ab" from further back, non-overlapping
        let mut input = encode(&[(b'a', 0), (b'b', 0)]);
        input.push(b'a');
        input.push(2);
        let out = decompress(&input, 5).unwrap();
        assert_eq!(out, b"ababa");
    }
}
