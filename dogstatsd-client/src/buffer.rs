use bytes::{BufMut as _, Bytes, BytesMut};

/// Accumulates packets into larger payloads for more efficient network I/O.
///
/// DogStatsD packets are always newline delimited, which means that multiple packets can be sent in a single payload
/// and then trivially split apart by the remote server. Every packet is accounted for with one extra byte for its
/// separator, so `total_size` is always exactly the length of the payload that [`PacketBuffer::take_payload`] would
/// produce.
pub(crate) struct PacketBuffer {
    packets: Vec<Bytes>,
    total_size: usize,
    capacity: usize,
}

impl PacketBuffer {
    /// Creates a new, empty `PacketBuffer` that produces payloads of at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { packets: Vec::new(), total_size: 0, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[cfg(test)]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Returns `true` if a packet of `len` bytes could never fit, even in an empty buffer.
    pub fn exceeds_capacity(&self, len: usize) -> bool {
        len + 1 > self.capacity
    }

    /// Returns `true` if appending a packet of `len` bytes would exceed the capacity.
    pub fn would_overflow(&self, len: usize) -> bool {
        self.total_size + len + 1 > self.capacity
    }

    /// Appends a packet.
    ///
    /// Callers are expected to check [`PacketBuffer::would_overflow`] first and drain the buffer if needed.
    pub fn push(&mut self, packet: Bytes) {
        self.total_size += packet.len() + 1;
        self.packets.push(packet);
    }

    /// Joins all buffered packets into a single newline-delimited payload and resets the buffer.
    ///
    /// Returns `None` if the buffer is empty.
    pub fn take_payload(&mut self) -> Option<Bytes> {
        if self.packets.is_empty() {
            return None;
        }

        let mut payload = BytesMut::with_capacity(self.total_size);
        for packet in self.packets.drain(..) {
            payload.extend_from_slice(&packet);
            payload.put_u8(b'\n');
        }
        self.total_size = 0;

        Some(payload.freeze())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::PacketBuffer;

    #[test]
    fn empty_buffer_has_no_payload() {
        let mut buffer = PacketBuffer::new(64);
        assert!(buffer.take_payload().is_none());
        assert_eq!(buffer.total_size(), 0);
    }

    #[test]
    fn accounts_for_separators() {
        let mut buffer = PacketBuffer::new(64);
        buffer.push(Bytes::from_static(b"a:1|c"));
        buffer.push(Bytes::from_static(b"b:22|g"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_size(), 6 + 7);

        let payload = buffer.take_payload().unwrap();
        assert_eq!(&payload[..], b"a:1|c\nb:22|g\n");
        assert_eq!(payload.len(), 13);

        assert!(buffer.is_empty());
        assert_eq!(buffer.total_size(), 0);
    }

    #[test]
    fn overflow_boundary() {
        // "a:1|c" plus separator is 6 bytes, so exactly two fit in 12 bytes.
        let mut buffer = PacketBuffer::new(12);
        assert!(!buffer.would_overflow(5));
        buffer.push(Bytes::from_static(b"a:1|c"));
        assert!(!buffer.would_overflow(5));
        buffer.push(Bytes::from_static(b"a:1|c"));
        assert!(buffer.would_overflow(5));
        assert!(buffer.would_overflow(1));
        assert_eq!(buffer.total_size(), buffer.capacity());
    }

    #[test]
    fn exceeds_capacity() {
        let buffer = PacketBuffer::new(12);
        assert!(!buffer.exceeds_capacity(11));
        assert!(buffer.exceeds_capacity(12));
    }
}
