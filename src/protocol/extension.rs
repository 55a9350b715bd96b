/// Extended-protocol payload (BEP 10). We pick the ids we expect for
/// incoming messages, so each extension carries its own constant; the id a
/// message is *sent* with always comes from the remote handshake's `m`
/// dictionary.
pub trait Extension<'a>: Into<bytes::Bytes> + TryFrom<&'a [u8]> {
    const NAME: &'static str;
    const CLIENT_ID: u8;
}
