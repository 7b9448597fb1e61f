use anyhow::{Result, anyhow};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingSource {
    Override,
    Bom,
    Detector,
    AssumedUtf8,
}

/// The character encoding a file was read with, remembered so a later write
/// produces the same bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEncoding {
    pub encoding: &'static Encoding,
    pub source: EncodingSource,
}

impl FileEncoding {
    pub fn utf8() -> FileEncoding {
        FileEncoding {
            encoding: UTF_8,
            source: EncodingSource::AssumedUtf8,
        }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encodes `text`, restoring the byte-order mark when one was detected.
    /// UTF-16 is written by hand because encoding_rs only decodes it.
    pub fn encode(&self, text: &str) -> (Vec<u8>, bool) {
        let bom = self.source == EncodingSource::Bom;
        if self.encoding == UTF_16LE || self.encoding == UTF_16BE {
            let little = self.encoding == UTF_16LE;
            let mut bytes = Vec::with_capacity(text.len() * 2 + 2);
            if bom {
                bytes.extend_from_slice(if little { &[0xFF, 0xFE] } else { &[0xFE, 0xFF] });
            }
            for unit in text.encode_utf16() {
                let pair = if little {
                    unit.to_le_bytes()
                } else {
                    unit.to_be_bytes()
                };
                bytes.extend_from_slice(&pair);
            }
            return (bytes, false);
        }

        let (encoded, _, had_errors) = self.encoding.encode(text);
        let mut bytes = Vec::with_capacity(encoded.len() + 3);
        if bom && self.encoding == UTF_8 {
            bytes.extend_from_slice(&[0xEF, 0xBB, 0xBF]);
        }
        bytes.extend_from_slice(&encoded);
        (bytes, had_errors)
    }
}

#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub had_errors: bool,
    pub encoding: FileEncoding,
}

/// Decides how file bytes are decoded: an explicit override, otherwise BOM, then
/// UTF-8 validity, then a statistical guess.
#[derive(Debug, Clone, Default)]
pub struct EncodingPolicy {
    override_encoding: Option<&'static Encoding>,
}

impl EncodingPolicy {
    pub fn new(override_label: Option<&str>) -> Result<Self> {
        let Some(label) = override_label else {
            return Ok(Self::default());
        };
        let trimmed = label.trim();
        let encoding = Encoding::for_label(trimmed.as_bytes())
            .ok_or_else(|| anyhow!("unknown encoding override '{trimmed}'"))?;
        Ok(Self {
            override_encoding: Some(encoding),
        })
    }

    /// Encoding used for files that do not exist yet.
    pub fn for_new_file(&self) -> FileEncoding {
        match self.override_encoding {
            Some(encoding) => FileEncoding {
                encoding,
                source: EncodingSource::Override,
            },
            None => FileEncoding::utf8(),
        }
    }

    pub fn detect(&self, bytes: &[u8]) -> FileEncoding {
        if let Some(encoding) = self.override_encoding {
            return FileEncoding {
                encoding,
                source: EncodingSource::Override,
            };
        }
        if let Some((encoding, _)) = Encoding::for_bom(bytes) {
            return FileEncoding {
                encoding,
                source: EncodingSource::Bom,
            };
        }
        if std::str::from_utf8(bytes).is_ok() {
            return FileEncoding::utf8();
        }
        let mut detector = EncodingDetector::new();
        detector.feed(bytes, true);
        FileEncoding {
            encoding: detector.guess(None, true),
            source: EncodingSource::Detector,
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> DecodedText {
        let encoding = self.detect(bytes);
        let (text, had_errors) = match encoding.source {
            EncodingSource::Bom => {
                let (cow, had_errors) = encoding.encoding.decode_with_bom_removal(bytes);
                (cow.into_owned(), had_errors)
            }
            _ => {
                let (cow, had_errors) = encoding.encoding.decode_without_bom_handling(bytes);
                (cow.into_owned(), had_errors)
            }
        };
        DecodedText {
            text,
            had_errors,
            encoding,
        }
    }
}
