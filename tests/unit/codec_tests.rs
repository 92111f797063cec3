//! Output line framing for child stdout/stderr.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use stagehand::orchestrator::codec::{OutputLine, OutputLineCodec};

fn line(text: &str) -> Option<OutputLine> {
    Some(OutputLine {
        text: text.to_owned(),
        truncated: false,
    })
}

#[test]
fn latin1_bytes_decode_lossily_and_framing_continues() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from(&b"caf\xe9\n\xff\nUsing subdriver\n"[..]);

    assert_eq!(codec.decode(&mut buf).expect("decode"), line("caf\u{fffd}"));
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("\u{fffd}"));
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("Using subdriver"));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
}

#[test]
fn crlf_is_stripped() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from(&b"upsd ready\r\n"[..]);
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("upsd ready"));
}

#[test]
fn partial_line_waits_for_newline() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from(&b"Using sub"[..]);
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);

    buf.extend_from_slice(b"driver\n");
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("Using subdriver"));
}

#[test]
fn overlong_line_is_truncated_and_tail_discarded() {
    let mut codec = OutputLineCodec::with_max_length(4);
    let mut buf = BytesMut::from(&b"abcdefgh"[..]);

    let head = codec.decode(&mut buf).expect("decode").expect("head");
    assert_eq!(head.text, "abcd");
    assert!(head.truncated);
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    assert!(buf.is_empty(), "discarded bytes are not buffered");

    buf.extend_from_slice(b"ijk\nok\n");
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("ok"));
}

#[test]
fn overlong_line_with_newline_in_buffer_is_truncated() {
    let mut codec = OutputLineCodec::with_max_length(3);
    let mut buf = BytesMut::from(&b"abcdef\nxy\n"[..]);

    let head = codec.decode(&mut buf).expect("decode").expect("head");
    assert_eq!(head.text, "abc");
    assert!(head.truncated);
    assert_eq!(codec.decode(&mut buf).expect("decode"), line("xy"));
}

#[test]
fn unterminated_tail_is_flushed_at_eof() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from(&b"last words"[..]);

    assert_eq!(codec.decode_eof(&mut buf).expect("eof"), line("last words"));
    assert_eq!(codec.decode_eof(&mut buf).expect("eof"), None);
}
