pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_max_versions() -> usize {
    3
}

pub(super) fn default_split_size_bytes() -> u64 {
    128 * 1024 * 1024
}

pub(super) fn default_chunk_size_bytes() -> u32 {
    64 * 1024 * 1024
}

pub(super) fn default_sftp_port() -> u16 {
    22
}

pub(super) fn default_shell_program() -> String {
    "rclone".to_string()
}

pub(super) fn default_max_retries() -> u32 {
    3
}

pub(super) fn default_retry_delay_ms() -> u64 {
    2_000
}

pub(super) fn default_retry_max_delay_ms() -> u64 {
    30_000
}
