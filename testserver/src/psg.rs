/// Builds a PSG reply body out of chunks.
///
/// Chunks of the reply itself are counted, and [`ReplyBody::build`] closes the
/// body with the reply meta chunk announcing their number.
#[derive(Clone, Debug, Default)]
pub struct ReplyBody {
    body: Vec<u8>,
    chunks: usize,
}

impl ReplyBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw chunk. A `size` argument is added for non-empty data.
    pub fn chunk(mut self, args: &str, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();

        self.body.extend_from_slice(b"\n\nPSG-Reply-Chunk: ");
        self.body.extend_from_slice(args.as_bytes());

        if !data.is_empty() {
            self.body
                .extend_from_slice(format!("&size={}", data.len()).as_bytes());
        }

        self.body.push(b'\n');
        self.body.extend_from_slice(data);
        self.chunks += 1;
        self
    }

    /// Append a complete item made of one data chunk and its meta chunk.
    pub fn item(self, item_id: u32, item_type: &str, data: impl AsRef<[u8]>) -> Self {
        self.chunk(
            &format!("item_id={}&item_type={}&chunk_type=data", item_id, item_type),
            data,
        )
        .chunk(
            &format!("item_id={}&item_type={}&chunk_type=meta&n_chunks=2", item_id, item_type),
            "",
        )
    }

    /// Append a reply level message.
    pub fn message(self, severity: &str, text: &str) -> Self {
        self.chunk(
            &format!("item_type=reply&chunk_type=message&severity={}", severity),
            text,
        )
    }

    /// Close the body with the reply meta chunk.
    pub fn build(self) -> Vec<u8> {
        let n_chunks = self.chunks + 1;

        self.chunk(&format!("item_type=reply&chunk_type=meta&n_chunks={}", n_chunks), "")
            .body
    }

    /// The body as is, without a closing meta chunk.
    pub fn unfinished(self) -> Vec<u8> {
        self.body
    }
}
