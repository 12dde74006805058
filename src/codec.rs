use bytes::Bytes;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

/// Classical DNS datagram size; each read starts with this many bytes.
pub const RECV_BUF_LEN: usize = 576;
/// Backing capacity of the receive buffer.
pub const RECV_BUF_CAPACITY: usize = 1024;

/// Parses one datagram into a DNS message. Failures classify the datagram
/// as malformed; the caller drops it and keeps serving.
pub fn parse(datagram: &[u8]) -> Result<Message, ProtoError> {
    Message::from_bytes(datagram)
}

/// Serializes a message back to wire bytes.
pub fn emit(msg: &Message) -> Result<Bytes, ProtoError> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

/// Rewrites a query in place into its blocked reply: name error, no answers.
/// Transaction id, opcode and the question section stay untouched so the
/// client can pair the reply with its query.
pub fn into_blocked_reply(msg: &mut Message) {
    msg.set_message_type(MessageType::Response);
    msg.set_authoritative(true);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NXDomain);
    msg.take_answers();
    msg.take_name_servers();
    msg.take_additionals();
    *msg.extensions_mut() = None;
}
