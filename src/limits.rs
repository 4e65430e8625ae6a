pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SUBJECT_LEN: usize = 512;
pub const MAX_PERIODS_PER_LOCATION: usize = 32;
pub const MAX_SUPERVISORS_PER_LOCATION: usize = 64;
pub const MAX_WINDOWS_PER_USER: usize = 1024;
/// Writes per atomic commit. A lifecycle commit touches at most four documents.
pub const MAX_COMMIT_WRITES: usize = 64;
pub const MAX_BATCH_WORKERS: usize = 256;
pub const MAX_PARTITIONS: usize = 64;
pub const MAX_PARTITION_NAME_LEN: usize = 128;
/// Largest WAL record replay will accept. A longer length prefix is treated as a torn tail.
pub const MAX_WAL_RECORD_BYTES: usize = 16 * 1024 * 1024;
