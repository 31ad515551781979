use crate::archive::SubmitLimits;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadParams {
    #[serde(rename = "batch-objects", default = "default_batch_objects")]
    pub batch_objects: usize,
    #[serde(rename = "batch-bytes", default = "default_batch_bytes")]
    pub batch_bytes: usize,
    #[serde(rename = "cache-size", default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "retry-delay-ms", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            batch_objects: default_batch_objects(),
            batch_bytes: default_batch_bytes(),
            cache_size: default_cache_size(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LoadParams {
    pub fn submit_limits(&self) -> SubmitLimits {
        SubmitLimits {
            batch_objects: self.batch_objects,
            batch_bytes: self.batch_bytes,
            cache_size: self.cache_size,
            max_attempts: self.max_attempts,
            retry_delay: std::time::Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[inline(always)]
fn default_batch_objects() -> usize {
    2000
}

#[inline(always)]
fn default_batch_bytes() -> usize {
    8 * 1024 * 1024
}

#[inline(always)]
fn default_cache_size() -> usize {
    100_000
}

#[inline(always)]
fn default_max_attempts() -> u32 {
    4
}

#[inline(always)]
fn default_retry_delay_ms() -> u64 {
    500
}
