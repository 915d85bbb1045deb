use std::path::PathBuf;

use async_trait::async_trait;

use super::json_file::JsonFile;
use crate::db::models::Submission;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    async fn list(&self) -> AppResult<Vec<Submission>>;
    async fn find(&self, id: &str) -> AppResult<Option<Submission>>;
    async fn add(&self, submission: Submission) -> AppResult<Submission>;
    /// Remove and return the submission.
    async fn take(&self, id: &str) -> AppResult<Submission>;
}

pub struct JsonSubmissionRepository {
    file: JsonFile<Submission>,
}

impl JsonSubmissionRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonSubmissionRepository {
            file: JsonFile::new(path),
        }
    }
}

#[async_trait]
impl SubmissionRepository for JsonSubmissionRepository {
    async fn list(&self) -> AppResult<Vec<Submission>> {
        self.file.read_all().await
    }

    async fn find(&self, id: &str) -> AppResult<Option<Submission>> {
        let submissions = self.file.read_all().await?;
        Ok(submissions.into_iter().find(|s| s.id == id))
    }

    async fn add(&self, submission: Submission) -> AppResult<Submission> {
        self.file
            .update(move |submissions| {
                submissions.push(submission.clone());
                Ok(submission)
            })
            .await
    }

    async fn take(&self, id: &str) -> AppResult<Submission> {
        self.file
            .update(|submissions| {
                let index = submissions
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or_else(|| AppError::NotFound(format!("Submission {} not found", id)))?;
                Ok(submissions.remove(index))
            })
            .await
    }
}
