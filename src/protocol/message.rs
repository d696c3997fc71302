use bytes::Bytes;

/// The (id, length, payload) triple carried between layers.
///
/// A message starts out *undecoded*: `data` holds a complete frame as emitted
/// by the framer and `id` is not yet meaningful. The decode interceptor
/// replaces it with the decoded form, after which `data_len == data.len()`
/// always holds.
#[derive(Debug, Clone, Default)]
pub struct Message {
    id: u32,
    data_len: u32,
    data: Bytes,
}

impl Message {
    pub fn new(id: u32, data: Bytes) -> Self {
        Message {
            id,
            data_len: data.len() as u32,
            data,
        }
    }

    /// Wraps a raw frame before header decoding. `data_len` reflects the
    /// frame size, not the header-declared payload length.
    pub fn undecoded(frame: Bytes) -> Self {
        Message {
            id: 0,
            data_len: frame.len() as u32,
            data: frame,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}
