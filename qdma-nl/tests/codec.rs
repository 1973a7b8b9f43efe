use qdma_nl::attr::put_attr;
use qdma_nl::{AttrType, Attrs, Error, Frame, Message, Op, QueueFlags, ATTR_MAX};

const FAMILY: u16 = 0x11;

#[test]
fn test_queue_add_roundtrip() {
    let attrs = Attrs::new()
        .with_u32(AttrType::DevIdx, 0)
        .with_u32(AttrType::QIdx, 5)
        .with_u32(
            AttrType::QFlag,
            (QueueFlags::DIR_H2C | QueueFlags::MODE_MM).bits(),
        );
    let mut msg = Message::request(FAMILY, Op::QAdd, attrs);
    msg.seq = 42;
    msg.pid = 1000;

    let decoded = Message::decode(&msg.encode()).unwrap();
    assert_eq!(decoded.op, Op::QAdd);
    assert_eq!(decoded.seq, 42);
    assert_eq!(decoded.attrs.u32(AttrType::QIdx), Some(5));
    assert_eq!(decoded.attrs.u32(AttrType::QFlag), Some(0x6));
    assert_eq!(decoded.attrs.len(), 3);
    assert_eq!(decoded, msg);
}

#[test]
fn test_unknown_attribute_rejects_message() {
    let msg = Message::request(
        FAMILY,
        Op::QDel,
        Attrs::new().with_u32(AttrType::DevIdx, 0),
    );
    let mut buf = msg.encode();
    put_attr(&mut buf, ATTR_MAX + 1, &1u32.to_ne_bytes());
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());

    assert_eq!(
        Message::decode(&buf),
        Err(Error::UnknownAttribute(ATTR_MAX + 1))
    );
}

#[test]
fn test_text_reply_through_frame() {
    let request = Message::request(FAMILY, Op::DevList, Attrs::new());
    let reply = request.reply(
        Attrs::new().with_str(AttrType::GenMsg, "qdma0\t01:00.0\tmax QP: 2048\n"),
    );
    match Frame::decode(&reply.encode()).unwrap() {
        Frame::Message(m) => {
            assert_eq!(m.op, Op::DevList);
            assert!(m.attrs.str(AttrType::GenMsg).unwrap().starts_with("qdma0"));
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn test_missing_attribute() {
    let attrs = Attrs::new().with_u32(AttrType::DevIdx, 0);
    assert_eq!(
        attrs.require_u32(AttrType::QIdx),
        Err(Error::MissingAttribute(AttrType::QIdx))
    );
}
