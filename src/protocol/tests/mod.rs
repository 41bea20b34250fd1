use rand::{thread_rng, Rng};
use rstest::*;

use crate::protocol::*;

fn payload(requester: RequesterId, data: &[u8]) -> Vec<u8> {
    let mut payload = requester.to_ne_bytes().to_vec();
    payload.extend_from_slice(data);
    payload
}

fn payloads() -> Vec<Vec<u8>> {
    vec![
        payload(7, b"AB"),
        vec![],
        (0..=255).collect(),
        vec![42; 3000],
        payload(-3, b"last one"),
    ]
}

fn stream_of(payloads: &[Vec<u8>]) -> Vec<u8> {
    payloads.iter().flat_map(|payload| encode_request(payload)).collect()
}

/// push every chunk through a receive buffer of `buffer_len` bytes and collect the messages
fn reassemble<'a, I>(chunks: I, buffer_len: usize) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut buf = RecvBuffer::with_capacity(buffer_len);
    let mut assembler = FrameAssembler::new(1 << 20);
    let mut messages = vec![];

    for chunk in chunks {
        let mut rest = chunk;
        while !rest.is_empty() {
            let taken = buf.extend_from_slice(rest);
            rest = &rest[taken..];

            while let Some(message) = assembler.next_message(&mut buf).unwrap() {
                messages.push(message);
            }
        }
    }

    assert!(!assembler.in_progress());
    assert!(buf.is_empty());
    messages
}

#[rstest]
#[case::one_byte_at_a_time(1)]
#[case::two_bytes(2)]
#[case::unaligned(7)]
#[case::prefix_sized(LENGTH_PREFIX_LEN)]
#[case::large(4096)]
fn fragmented_stream_reassembles_in_order(#[case] chunk_size: usize) {
    let payloads = payloads();
    let stream = stream_of(&payloads);

    for buffer_len in &[LENGTH_PREFIX_LEN, 64, 1024] {
        let messages = reassemble(stream.chunks(chunk_size), *buffer_len);
        assert_eq!(messages, payloads);
    }
}

#[test]
fn random_fragmentation_reassembles_in_order() {
    let mut rng = thread_rng();
    let payloads = payloads();
    let stream = stream_of(&payloads);

    for _ in 0..50 {
        let mut chunks = vec![];
        let mut rest = &stream[..];
        while !rest.is_empty() {
            let len = rng.gen_range(1..=rest.len().min(512));
            chunks.push(&rest[..len]);
            rest = &rest[len..];
        }

        assert_eq!(reassemble(chunks, 1024), payloads);
    }
}

#[test]
fn back_to_back_messages_in_one_read() {
    let payloads = payloads();
    let stream = stream_of(&payloads[..1]);
    let doubled = [stream.clone(), stream].concat();

    let messages = reassemble(vec![&doubled[..]], 1024);
    assert_eq!(messages, vec![payloads[0].clone(), payloads[0].clone()]);
}

#[test]
fn length_prefix_needs_a_full_word() {
    let mut buf = RecvBuffer::with_capacity(64);
    let frame = encode_request(b"abcd");

    buf.extend_from_slice(&frame[..LENGTH_PREFIX_LEN - 1]);
    assert_eq!(try_consume_length_prefix(&mut buf), None);
    assert_eq!(buf.filled(), LENGTH_PREFIX_LEN - 1);

    buf.extend_from_slice(&frame[LENGTH_PREFIX_LEN - 1..]);
    assert_eq!(try_consume_length_prefix(&mut buf), Some(4));

    let mut body = vec![];
    assert_eq!(try_consume_body(&mut buf, &mut body, 2), 2);
    assert_eq!(try_consume_body(&mut buf, &mut body, 10), 2);
    assert_eq!(body, b"abcd");
    assert!(buf.is_empty());
}

#[test]
fn oversized_message_is_a_protocol_error() {
    let mut buf = RecvBuffer::with_capacity(64);
    let mut assembler = FrameAssembler::new(16);
    buf.extend_from_slice(&encode_request(&[0; 17]));

    assert_eq!(
        assembler.next_message(&mut buf),
        Err(ProtocolError::MessageTooLarge { len: 17, max: 16 })
    );
    assert!(!assembler.in_progress());
}

#[test]
fn partial_message_can_be_dropped() {
    let mut buf = RecvBuffer::with_capacity(64);
    let mut assembler = FrameAssembler::new(1024);
    let frame = encode_request(b"incomplete");
    buf.extend_from_slice(&frame[..frame.len() - 1]);

    assert_eq!(assembler.next_message(&mut buf), Ok(None));
    assert!(assembler.in_progress());

    assembler.reset();
    assert!(!assembler.in_progress());
}

#[test]
fn requester_id_is_read_from_leading_bytes() {
    assert_eq!(requester_id(&payload(7, b"AB")), Ok(7));
    assert_eq!(requester_id(b"ab"), Err(ProtocolError::MissingRequester(2)));
}

#[test]
fn ack_carries_applied_status() {
    assert_eq!(decode_status(encode_ack()), STATUS_APPLIED);
}
