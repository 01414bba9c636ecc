//! Whole-file decryption of device uploads with per-line recovery.
//!
//! The first non-empty line is the key envelope; every following line is
//! decrypted independently. Recoverable line errors are recorded and skipped,
//! fatal ones stop the file but keep what was already recovered.

use tracing::debug;
use zeroize::Zeroizing;

use crate::base64::{decode_base64, encode_base64};
use crate::diagnostics::{DiagnosticRecord, DiagnosticSink, REDACTED};
use crate::error::{FileDecryptError, KeyError, LineError};
use crate::keys::StudyPrivateKey;
use crate::line::decrypt_device_line;

/// Who and what a decryption is for; copied into every diagnostic record.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticContext {
    pub participant_id: String,
    pub file_name: String,
    /// Replace raw line contents in records (audio, video, images)
    pub redact_lines: bool,
}

impl DiagnosticContext {
    pub fn new(participant_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            file_name: file_name.into(),
            redact_lines: false,
        }
    }

    pub fn redacted(mut self, redact: bool) -> Self {
        self.redact_lines = redact;
        self
    }

    fn render(&self, bytes: &[u8]) -> String {
        if self.redact_lines {
            REDACTED.to_string()
        } else {
            encode_base64(bytes)
        }
    }
}

/// Result of decrypting a device file, complete or partial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDecryption {
    /// Recovered lines in input order, each terminated by `\n`
    pub plaintext: Vec<u8>,
    /// Non-empty input lines, the envelope included
    pub total_lines: usize,
    /// Number of data lines recovered
    pub decrypted_lines: usize,
    pub errors: Vec<LineError>,
}

impl FileDecryption {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// Decrypt a device upload.
///
/// On success, `decrypted_lines + error_count() == total_lines - 1`.
pub fn decrypt_device_file(
    ctx: &DiagnosticContext,
    data: &[u8],
    private_key: &StudyPrivateKey,
    sink: &dyn DiagnosticSink,
) -> Result<FileDecryption, FileDecryptError> {
    let lines: Vec<&[u8]> = data
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .collect();
    let Some(envelope) = lines.first() else {
        return Err(FileDecryptError::EmptyFile);
    };

    let file_key = match unwrap_file_key(private_key, envelope) {
        Ok(key) => key,
        Err(e) => {
            sink.record(DiagnosticRecord::KeyError {
                participant_id: ctx.participant_id.clone(),
                file_name: ctx.file_name.clone(),
                contents: ctx.render(data),
                reason: e.to_string(),
            });
            return Err(e.into());
        }
    };

    let mut result = FileDecryption {
        total_lines: lines.len(),
        ..Default::default()
    };

    for (index, line) in lines.iter().enumerate().skip(1) {
        let failure = match decrypt_device_line(&file_key, line) {
            Ok(plain) => {
                result.plaintext.extend_from_slice(&plain);
                result.plaintext.push(b'\n');
                result.decrypted_lines += 1;
                continue;
            }
            Err(failure) => failure,
        };

        let Some(kind) = failure.classify() else {
            emit_summary(ctx, &result, sink);
            return Err(FileDecryptError::Unclassified {
                index,
                source: failure,
            });
        };

        let error = LineError {
            kind,
            index,
            line: line.to_vec(),
            prev_line: lines[index - 1].to_vec(),
            next_line: lines.get(index + 1).map(|l| l.to_vec()).unwrap_or_default(),
        };
        sink.record(DiagnosticRecord::LineError {
            participant_id: ctx.participant_id.clone(),
            file_name: ctx.file_name.clone(),
            kind,
            index,
            line: ctx.render(&error.line),
            prev_line: ctx.render(&error.prev_line),
            next_line: ctx.render(&error.next_line),
        });
        result.errors.push(error);

        if kind.is_fatal() {
            emit_summary(ctx, &result, sink);
            return Err(FileDecryptError::Aborted {
                kind,
                index,
                partial: Box::new(result),
            });
        }
    }

    emit_summary(ctx, &result, sink);
    debug!(
        file = %ctx.file_name,
        lines = result.decrypted_lines,
        errors = result.error_count(),
        "decrypted device file"
    );
    Ok(result)
}

/// Envelope: base64( RSA( base64(file_key) ) ).
fn unwrap_file_key(
    private_key: &StudyPrivateKey,
    envelope: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let wrapped = decode_base64(envelope).map_err(KeyError::EnvelopeEncoding)?;
    let encoded = Zeroizing::new(
        private_key
            .unwrap_envelope(&wrapped)
            .map_err(|e| KeyError::Unwrap(e.to_string()))?,
    );
    decode_base64(&encoded)
        .map(Zeroizing::new)
        .map_err(KeyError::KeyEncoding)
}

fn emit_summary(ctx: &DiagnosticContext, result: &FileDecryption, sink: &dyn DiagnosticSink) {
    if result.errors.is_empty() {
        return;
    }
    sink.record(DiagnosticRecord::FileSummary {
        participant_id: ctx.participant_id.clone(),
        file_name: ctx.file_name.clone(),
        total_lines: result.total_lines,
        error_count: result.errors.len(),
        error_lines: result.errors.iter().map(|e| ctx.render(&e.line)).collect(),
        error_kinds: result.errors.iter().map(|e| e.kind).collect(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use crate::error::LineErrorKind;
    use crate::keys::generate_key_pairing;
    use crate::seal::DeviceSealer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        rng: StdRng,
        private: StudyPrivateKey,
        sealer: DeviceSealer,
    }

    impl Fixture {
        fn new() -> Self {
            let mut rng = StdRng::seed_from_u64(0xC0_40_27);
            let pairing = generate_key_pairing(&mut rng, 1024).unwrap();
            let private = StudyPrivateKey::from_pem(&pairing.private_pem).unwrap();
            let sealer = DeviceSealer::new(&mut rng);
            Self {
                rng,
                private,
                sealer,
            }
        }

        fn envelope(&mut self) -> String {
            let public = self.private.public_key();
            self.sealer.envelope(&mut self.rng, &public).unwrap()
        }

        fn line(&mut self, plaintext: &str) -> String {
            self.sealer
                .seal_line(&mut self.rng, plaintext.as_bytes())
                .unwrap()
        }

        fn decrypt(
            &self,
            lines: &[String],
            sink: &MemorySink,
        ) -> Result<FileDecryption, FileDecryptError> {
            let data = lines.join("\n");
            decrypt_device_file(
                &DiagnosticContext::new("p1", "p1_gps_1528848000000.csv"),
                data.as_bytes(),
                &self.private,
                sink,
            )
        }
    }

    fn iv_b64() -> String {
        encode_base64(&[0u8; 16])
    }

    #[test]
    fn test_well_formed_file() {
        let mut fx = Fixture::new();
        let mut lines = vec![fx.envelope()];
        for i in 0..5 {
            lines.push(fx.line(&format!("row {i}")));
        }

        let sink = MemorySink::new();
        let result = fx.decrypt(&lines, &sink).unwrap();

        assert_eq!(result.plaintext, b"row 0\nrow 1\nrow 2\nrow 3\nrow 4\n");
        assert_eq!(result.decrypted_lines, 5);
        assert_eq!(result.total_lines, 6);
        assert!(result.errors.is_empty());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_empty_lines_are_discarded() {
        let mut fx = Fixture::new();
        let lines = vec![
            fx.envelope(),
            String::new(),
            fx.line("a"),
            String::new(),
            String::new(),
            fx.line("b"),
        ];

        let result = fx.decrypt(&lines, &MemorySink::new()).unwrap();
        assert_eq!(result.plaintext, b"a\nb\n");
        assert_eq!(result.total_lines, 3);
    }

    #[test]
    fn test_empty_file() {
        let fx = Fixture::new();
        let sink = MemorySink::new();
        let err = fx.decrypt(&["".into(), "".into()], &sink).unwrap_err();
        assert!(matches!(err, FileDecryptError::EmptyFile));
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_corrupted_envelope() {
        let mut fx = Fixture::new();
        let lines = vec!["bm90IGFuIGVudmVsb3Bl".to_string(), fx.line("a"), fx.line("b")];

        let sink = MemorySink::new();
        let err = fx.decrypt(&lines, &sink).unwrap_err();

        assert!(matches!(err, FileDecryptError::KeyInvalid(KeyError::Unwrap(_))), "{err:?}");
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], DiagnosticRecord::KeyError { .. }));
    }

    #[test]
    fn test_envelope_not_base64() {
        let mut fx = Fixture::new();
        let lines = vec!["***".to_string(), fx.line("a")];
        let err = fx.decrypt(&lines, &MemorySink::new()).unwrap_err();
        assert!(matches!(
            err,
            FileDecryptError::KeyInvalid(KeyError::EnvelopeEncoding(_))
        ));
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut fx = Fixture::new();
        let lines = vec![
            fx.envelope(),
            fx.line("first"),
            "no-separator-here".to_string(),
            fx.line("third"),
        ];

        let sink = MemorySink::new();
        let result = fx.decrypt(&lines, &sink).unwrap();

        assert_eq!(result.plaintext, b"first\nthird\n");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, LineErrorKind::MalformedStructure);
        assert_eq!(result.errors[0].index, 2);
        assert_eq!(result.errors[0].prev_line, lines[1].as_bytes());
        assert_eq!(result.errors[0].next_line, lines[3].as_bytes());
        assert_eq!(result.decrypted_lines + result.error_count(), result.total_lines - 1);

        let records = sink.records();
        assert_eq!(records.len(), 2);
        match &records[1] {
            DiagnosticRecord::FileSummary {
                total_lines,
                error_count,
                error_kinds,
                ..
            } => {
                assert_eq!(*total_lines, 4);
                assert_eq!(*error_count, 1);
                assert_eq!(error_kinds, &vec![LineErrorKind::MalformedStructure]);
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn test_several_recoverable_errors() {
        let mut fx = Fixture::new();
        let iv = iv_b64();
        let lines = vec![
            fx.envelope(),
            " ".to_string(),
            fx.line("kept"),
            format!("{iv}:"),
            format!(":{iv}"),
            format!("{iv}:{}", encode_base64(&[0u8; 20])),
        ];

        let result = fx.decrypt(&lines, &MemorySink::new()).unwrap();
        let kinds: Vec<_> = result.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LineErrorKind::LineIsBlank,
                LineErrorKind::EmptyCiphertext,
                LineErrorKind::MissingIv,
                LineErrorKind::InvalidLength,
            ]
        );
        assert_eq!(result.plaintext, b"kept\n");
        assert_eq!(result.decrypted_lines + result.error_count(), result.total_lines - 1);
    }

    #[test]
    fn test_bad_iv_length_aborts_with_partial() {
        let mut fx = Fixture::new();
        let lines = vec![
            fx.envelope(),
            fx.line("one"),
            fx.line("two"),
            format!("{}:{}", encode_base64(&[0u8; 8]), encode_base64(&[0u8; 16])),
            fx.line("never reached"),
        ];

        let sink = MemorySink::new();
        let err = fx.decrypt(&lines, &sink).unwrap_err();

        match err {
            FileDecryptError::Aborted {
                kind,
                index,
                partial,
            } => {
                assert_eq!(kind, LineErrorKind::IvBadLength);
                assert_eq!(index, 3);
                assert_eq!(partial.plaintext, b"one\ntwo\n");
                assert_eq!(partial.errors.len(), 1);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(matches!(
            sink.records().last(),
            Some(DiagnosticRecord::FileSummary { .. })
        ));
    }

    #[test]
    fn test_truncated_base64_aborts() {
        let mut fx = Fixture::new();
        let lines = vec![
            fx.envelope(),
            fx.line("one"),
            format!("{}:AAA=AAAA", iv_b64()),
        ];

        let err = fx.decrypt(&lines, &MemorySink::new()).unwrap_err();
        assert!(matches!(
            err,
            FileDecryptError::Aborted {
                kind: LineErrorKind::TruncatedBase64,
                index: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_base64_length_error_is_unclassified() {
        let mut fx = Fixture::new();
        let lines = vec![fx.envelope(), format!("{}:AAAAA", iv_b64())];

        let err = fx.decrypt(&lines, &MemorySink::new()).unwrap_err();
        assert!(matches!(err, FileDecryptError::Unclassified { index: 1, .. }));
        assert!(!err.is_handled());
    }

    #[test]
    fn test_bad_key_length_aborts() {
        let mut rng = StdRng::seed_from_u64(77);
        let pairing = generate_key_pairing(&mut rng, 1024).unwrap();
        let private = StudyPrivateKey::from_pem(&pairing.private_pem).unwrap();
        let sealer = DeviceSealer::with_key(vec![1u8; 10]);
        let envelope = sealer.envelope(&mut rng, &private.public_key()).unwrap();
        let data = format!("{envelope}\n{}:{}\n", iv_b64(), encode_base64(&[0u8; 16]));

        let err = decrypt_device_file(
            &DiagnosticContext::new("p1", "f.csv"),
            data.as_bytes(),
            &private,
            &MemorySink::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FileDecryptError::Aborted {
                kind: LineErrorKind::KeyBadLength,
                ..
            }
        ));
    }

    #[test]
    fn test_sensitive_media_is_redacted() {
        let mut fx = Fixture::new();
        let data = format!("{}\nbroken\n{}\n", fx.envelope(), fx.line("ok"));
        let ctx = DiagnosticContext::new("p1", "p1_voiceRecording_1.mp4").redacted(true);

        let sink = MemorySink::new();
        decrypt_device_file(&ctx, data.as_bytes(), &fx.private, &sink).unwrap();

        for record in sink.records() {
            match record {
                DiagnosticRecord::LineError {
                    line,
                    prev_line,
                    next_line,
                    ..
                } => {
                    assert_eq!(line, REDACTED);
                    assert_eq!(prev_line, REDACTED);
                    assert_eq!(next_line, REDACTED);
                }
                DiagnosticRecord::FileSummary { error_lines, .. } => {
                    assert_eq!(error_lines, vec![REDACTED.to_string()]);
                }
                DiagnosticRecord::KeyError { .. } => panic!("unexpected key error"),
            }
        }
    }
}
