use remote_analyze_storage::{Digest, JobId};

/// Key layout of one job in the key/value store
pub struct JobKeys {
    job_id: String,
}

impl JobKeys {
    pub fn new(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.as_str().to_string(),
        }
    }

    pub fn state(&self) -> String {
        format!("job:{}:state", self.job_id)
    }

    /// Number of parts durably stored
    pub fn parts(&self) -> String {
        format!("job:{}:parts", self.job_id)
    }

    pub fn completed_parts(&self) -> String {
        format!("job:{}:completed_parts", self.job_id)
    }

    /// Part number allocation counter
    pub fn allocated_parts(&self) -> String {
        format!("job:{}:allocated_parts", self.job_id)
    }

    /// Part count fixed when the client declares the submission finished
    pub fn expected_parts(&self) -> String {
        format!("job:{}:expected_parts", self.job_id)
    }

    /// Marker set once a part's analysis has been counted
    pub fn part_done(&self, part: u64) -> String {
        format!("job:{}:part:{}:done", self.job_id, part)
    }

    pub fn created_at(&self) -> String {
        format!("job:{}:created_at", self.job_id)
    }
}

/// Existence-index key of a blob
pub fn blob_key(digest: &Digest) -> String {
    format!("blob:{}", digest.as_str())
}
