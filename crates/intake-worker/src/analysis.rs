//! Analysis stage.
//!
//! The executor only knows the `AnalysisStage` trait; what an analysis does
//! with the artifact bytes is up to the implementation. The shipped
//! `ByteLengthAnalyzer` measures and fingerprints the artifact.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use intake_models::{AnalysisResult, JobDescriptor};
use intake_storage::{ArtifactBody, StorageError};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Artifact is empty")]
    EmptyArtifact,

    #[error("Artifact {key} exceeds {limit} bytes")]
    TooLarge { key: String, limit: u64 },

    #[error("Unsupported artifact: {0}")]
    Unsupported(String),

    #[error("Failed to read artifact: {0}")]
    Read(#[source] StorageError),
}

impl AnalysisError {
    /// Read failures come from the store, not the artifact, and may pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::Read(_))
    }
}

/// Turns one artifact into an analysis result.
///
/// Implementations must not touch pipeline state: the same descriptor and
/// bytes may be analyzed more than once.
#[async_trait]
pub trait AnalysisStage: Send + Sync {
    /// Name recorded in results.
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        job: &JobDescriptor,
        body: ArtifactBody,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Placeholder analysis: byte count and SHA-256 digest, computed while
/// streaming so memory use does not grow with artifact size.
#[derive(Debug, Clone)]
pub struct ByteLengthAnalyzer {
    max_bytes: u64,
}

impl ByteLengthAnalyzer {
    pub const NAME: &'static str = "byte-length";

    const NOTE: &'static str = "Placeholder analysis: size and content digest only";

    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

#[async_trait]
impl AnalysisStage for ByteLengthAnalyzer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn analyze(
        &self,
        job: &JobDescriptor,
        mut body: ArtifactBody,
    ) -> Result<AnalysisResult, AnalysisError> {
        if body.size_hint().is_some_and(|size| size > self.max_bytes) {
            return Err(AnalysisError::TooLarge {
                key: body.key().to_string(),
                limit: self.max_bytes,
            });
        }

        let mut hasher = Sha256::new();
        let mut byte_length: u64 = 0;
        while let Some(chunk) = body.next_chunk().await {
            let chunk = chunk.map_err(AnalysisError::Read)?;
            byte_length += chunk.len() as u64;
            if byte_length > self.max_bytes {
                return Err(AnalysisError::TooLarge {
                    key: body.key().to_string(),
                    limit: self.max_bytes,
                });
            }
            hasher.update(&chunk);
        }

        if byte_length == 0 {
            return Err(AnalysisError::EmptyArtifact);
        }

        let sha256 = format!("{:x}", hasher.finalize());
        Ok(AnalysisResult::for_job(job, Self::NAME, byte_length, sha256).with_note(Self::NOTE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn job() -> JobDescriptor {
        JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf")
    }

    fn body(data: &'static [u8], chunk_size: usize) -> ArtifactBody {
        ArtifactBody::from_bytes("applications/app-1/uploads/file.pdf", Bytes::from_static(data), chunk_size)
    }

    #[tokio::test]
    async fn test_counts_bytes_and_hashes() {
        let analyzer = ByteLengthAnalyzer::new(1024);

        let result = analyzer.analyze(&job(), body(b"hello world", 4)).await.unwrap();

        assert_eq!(result.byte_length, 11);
        assert_eq!(
            result.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(result.analyzer, "byte-length");
        assert_eq!(result.application_id, "app-1");
    }

    #[tokio::test]
    async fn test_chunking_does_not_change_outcome() {
        let analyzer = ByteLengthAnalyzer::new(1024);

        let a = analyzer.analyze(&job(), body(b"hello world", 1)).await.unwrap();
        let b = analyzer.analyze(&job(), body(b"hello world", 64)).await.unwrap();
        assert!(a.same_outcome(&b));
    }

    #[tokio::test]
    async fn test_empty_artifact_rejected() {
        let analyzer = ByteLengthAnalyzer::new(1024);

        let err = analyzer.analyze(&job(), body(b"", 4)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyArtifact));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_oversized_artifact_rejected() {
        let analyzer = ByteLengthAnalyzer::new(5);

        let err = analyzer.analyze(&job(), body(b"hello world", 4)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::TooLarge { limit: 5, .. }));
    }
}
