use memchr::memchr;

/// Reassembles newline-delimited text from arbitrarily split byte chunks.
///
/// Lines are trimmed; blank lines are dropped. Bytes that are not valid UTF-8
/// are reported through the returned `Err` entries so callers can log them
/// without aborting the stream.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, std::str::Utf8Error>> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<Result<String, std::str::Utf8Error>> {
        self.drain_lines(true)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<Result<String, std::str::Utf8Error>> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            Self::collect_line(&self.buffer[search_index..newline_index], &mut lines);
            search_index = newline_index + 1;
        }

        if flush {
            Self::collect_line(&self.buffer[search_index..], &mut lines);
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }

    fn collect_line(bytes: &[u8], lines: &mut Vec<Result<String, std::str::Utf8Error>>) {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(Ok(trimmed.to_string()));
                }
            }
            Err(err) => lines.push(Err(err)),
        }
    }
}
