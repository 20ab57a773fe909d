//! Storage strategy selection.
//!
//! Pure functions of the declared size and the configured policy. The
//! strategy and chunk geometry are fixed on the session at init and never
//! change across retries or resumes.

use crate::config::{ChunkingConfig, StrategyConfig, MAX_CHUNK_SIZE_BYTES, MIN_CHUNK_SIZE_BYTES};
use crate::database::entity::upload::StorageStrategy;

/// Picks the storage strategy for a declared size.
pub fn select_strategy(policy: &StrategyConfig, size: i64) -> StorageStrategy {
    if policy.enable_inline_blob && size <= policy.inline_max_bytes {
        return StorageStrategy::InlineBlob;
    }
    if policy.enable_release_assets && size <= policy.release_max_bytes {
        return StorageStrategy::ReleaseAsset;
    }
    if policy.enable_git_lfs && size <= policy.lfs_threshold_bytes {
        return StorageStrategy::GitLfs;
    }
    StorageStrategy::RepoChunks
}

/// Chunk size for a declared size: the configured default, clamped to the
/// hard bounds, and never larger than the upload itself.
pub fn chunk_size_for(chunking: &ChunkingConfig, size: i64) -> i64 {
    let ceiling = chunking.max_chunk_size.min(MAX_CHUNK_SIZE_BYTES);
    let chunk = chunking
        .default_chunk_size
        .clamp(MIN_CHUNK_SIZE_BYTES, ceiling.max(MIN_CHUNK_SIZE_BYTES));
    chunk.min(size)
}

/// Number of chunks needed to carry `size` bytes.
pub fn total_chunks(size: i64, chunk_size: i64) -> i32 {
    ((size + chunk_size - 1) / chunk_size) as i32
}

/// Size the chunk at `index` must have, given the session geometry.
pub fn expected_chunk_size(size: i64, chunk_size: i64, index: i32, total: i32) -> i64 {
    if index == total - 1 {
        size - (total as i64 - 1) * chunk_size
    } else {
        chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: i64 = 1024 * 1024;
    const GIB: i64 = 1024 * MIB;

    fn policy() -> StrategyConfig {
        StrategyConfig {
            max_upload_bytes: 10 * GIB,
            release_max_bytes: 2 * GIB,
            lfs_threshold_bytes: GIB,
            inline_max_bytes: 25 * MIB,
            enable_release_assets: true,
            enable_git_lfs: false,
            enable_inline_blob: false,
        }
    }

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            default_chunk_size: 25 * MIB,
            max_chunk_size: 50 * MIB,
        }
    }

    #[test]
    fn release_assets_win_below_the_boundary() {
        let policy = policy();
        assert_eq!(
            select_strategy(&policy, 100 * MIB),
            StorageStrategy::ReleaseAsset
        );
        assert_eq!(
            select_strategy(&policy, 2 * GIB),
            StorageStrategy::ReleaseAsset
        );
        assert_eq!(
            select_strategy(&policy, 2 * GIB + 1),
            StorageStrategy::RepoChunks
        );
    }

    #[test]
    fn repo_chunks_is_the_fallback() {
        let mut policy = policy();
        policy.enable_release_assets = false;
        assert_eq!(select_strategy(&policy, MIB), StorageStrategy::RepoChunks);
    }

    #[test]
    fn lfs_applies_when_enabled_and_small_enough() {
        let mut policy = policy();
        policy.enable_release_assets = false;
        policy.enable_git_lfs = true;
        assert_eq!(
            select_strategy(&policy, 512 * MIB),
            StorageStrategy::GitLfs
        );
        assert_eq!(
            select_strategy(&policy, GIB + 1),
            StorageStrategy::RepoChunks
        );
    }

    #[test]
    fn inline_blob_requires_the_flag() {
        let mut policy = policy();
        assert_ne!(select_strategy(&policy, MIB), StorageStrategy::InlineBlob);
        policy.enable_inline_blob = true;
        assert_eq!(select_strategy(&policy, MIB), StorageStrategy::InlineBlob);
    }

    #[test]
    fn chunk_size_is_clamped_and_bounded_by_size() {
        let chunking = chunking();
        assert_eq!(chunk_size_for(&chunking, 10 * GIB), 25 * MIB);
        assert_eq!(chunk_size_for(&chunking, 3 * MIB), 3 * MIB);

        let tiny_default = ChunkingConfig {
            default_chunk_size: 16 * 1024,
            max_chunk_size: 50 * MIB,
        };
        assert_eq!(chunk_size_for(&tiny_default, 10 * MIB), MIB);

        let huge_default = ChunkingConfig {
            default_chunk_size: 500 * MIB,
            max_chunk_size: 500 * MIB,
        };
        assert_eq!(chunk_size_for(&huge_default, 10 * GIB), 50 * MIB);
    }

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks(12_500_000, 5 * MIB), 3);
        assert_eq!(total_chunks(10 * MIB, 5 * MIB), 2);
        assert_eq!(total_chunks(1, MIB), 1);
    }

    #[test]
    fn last_chunk_carries_the_remainder() {
        let chunk = 5 * MIB;
        let size = 12_500_000;
        let total = total_chunks(size, chunk);
        assert_eq!(expected_chunk_size(size, chunk, 0, total), chunk);
        assert_eq!(expected_chunk_size(size, chunk, 1, total), chunk);
        assert_eq!(expected_chunk_size(size, chunk, 2, total), 2_014_240);

        // Exactly aligned: the last chunk is a full chunk.
        let aligned = 10 * MIB;
        let total = total_chunks(aligned, chunk);
        assert_eq!(expected_chunk_size(aligned, chunk, total - 1, total), chunk);
    }
}
