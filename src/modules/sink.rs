//! Line-oriented output sink for install/uninstall transcripts
//!
//! Progress lines are prefixed `- `, the terminating failure line `! `.
//! Every line is flushed as soon as it is written. The sink closes on drop.

use std::io::{BufWriter, Write};

pub struct OutputSink {
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Some(BufWriter::new(Box::new(writer))),
        }
    }

    /// A sink that discards output
    pub fn null() -> Self {
        Self::new(std::io::sink())
    }

    pub fn progress(&mut self, line: &str) {
        tracing::info!("{}", line);
        self.write_line("- ", line);
    }

    pub fn failure(&mut self, line: &str) {
        tracing::error!("{}", line);
        self.write_line("! ", line);
    }

    fn write_line(&mut self, prefix: &str, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writer
            .write_all(prefix.as_bytes())
            .and_then(|_| writer.write_all(line.as_bytes()))
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            tracing::error!("write output error: {}", e);
        }
    }

    /// Flush and release the underlying writer. Later writes are dropped.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!("close writer error: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer for inspecting transcripts
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        pub fn lines(&self) -> Vec<String> {
            self.text().lines().map(str::to_string).collect()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::SharedBuffer;
    use super::*;

    #[test]
    fn test_prefixes_and_close() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone());

        sink.progress("step one");
        sink.failure("it broke");
        assert_eq!(buffer.lines(), vec!["- step one", "! it broke"]);

        sink.close();
        assert!(sink.is_closed());
        sink.progress("ignored");
        assert_eq!(buffer.lines().len(), 2);
    }

    #[test]
    fn test_lines_visible_before_close() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone());
        sink.progress("flushed");
        assert_eq!(buffer.text(), "- flushed\n");
    }
}
