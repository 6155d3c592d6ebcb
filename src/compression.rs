//! 段文件的透明压缩
//!
//! `OutputFile` 统一了压缩与不压缩的写入，并通过 `physical_bytes()`
//! 报告编码器实际写出的字节数，调用方不需要关心具体是哪一种实现。

use std::io::{self, Read, Write};

use crate::config::CompressionAlgorithm;

/// 统计写入字节数的包装
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type Sink = CountingWriter<Box<dyn Write + Send>>;

pub enum OutputFile {
    Plain(Sink),
    Zstd(zstd::stream::write::Encoder<'static, Sink>),
    Lz4(lz4_flex::frame::FrameEncoder<Sink>),
}

impl OutputFile {
    pub fn new(
        algorithm: CompressionAlgorithm,
        zstd_level: i32,
        writer: Box<dyn Write + Send>,
    ) -> io::Result<OutputFile> {
        let sink = CountingWriter::new(writer);
        Ok(match algorithm {
            CompressionAlgorithm::None => OutputFile::Plain(sink),
            CompressionAlgorithm::Zstd => {
                OutputFile::Zstd(zstd::stream::write::Encoder::new(sink, zstd_level)?)
            }
            CompressionAlgorithm::Lz4 => OutputFile::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
        })
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        match self {
            OutputFile::Plain(_) => CompressionAlgorithm::None,
            OutputFile::Zstd(_) => CompressionAlgorithm::Zstd,
            OutputFile::Lz4(_) => CompressionAlgorithm::Lz4,
        }
    }

    /// 编码器实际写到底层文件的字节数，不压缩时返回 `None`
    ///
    /// 由于编码器内部缓冲和帧开销，它与写入的数据字节数不一致
    pub fn physical_bytes(&self) -> Option<u64> {
        match self {
            OutputFile::Plain(_) => None,
            OutputFile::Zstd(encoder) => Some(encoder.get_ref().count()),
            OutputFile::Lz4(encoder) => Some(encoder.get_ref().count()),
        }
    }

    /// 写完最后一帧并刷新，返回文件的总字节数
    pub fn finish(self) -> io::Result<u64> {
        let mut sink = match self {
            OutputFile::Plain(sink) => sink,
            OutputFile::Zstd(encoder) => encoder.finish()?,
            OutputFile::Lz4(encoder) => encoder.finish().map_err(io::Error::from)?,
        };
        sink.flush()?;
        Ok(sink.count())
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::Plain(sink) => sink.write(buf),
            OutputFile::Zstd(encoder) => encoder.write(buf),
            OutputFile::Lz4(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::Plain(sink) => sink.flush(),
            OutputFile::Zstd(encoder) => encoder.flush(),
            OutputFile::Lz4(encoder) => encoder.flush(),
        }
    }
}

/// 按压缩算法包装读取端
pub fn open_decoder(
    algorithm: CompressionAlgorithm,
    reader: Box<dyn Read + Send>,
) -> io::Result<Box<dyn Read + Send>> {
    Ok(match algorithm {
        CompressionAlgorithm::None => reader,
        CompressionAlgorithm::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        CompressionAlgorithm::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
    })
}
