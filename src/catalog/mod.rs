// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Video catalog and playlist ordering.
//!
//! The catalog (categories, videos, sync from the remote store) is owned
//! elsewhere; the cache only needs to resolve a video id and to find the
//! next video of the same playlist for prefetching.
//!
//! # Playlist order
//!
//! Titles starting with digits sort by that number first, so `"2 - Intro"`
//! comes before `"10 - Finale"`. Titles without a leading number follow all
//! numbered ones. Ties compare case-insensitively.

pub mod memory;

pub use memory::MemoryCatalog;

use std::cmp::Ordering;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{VideoDescriptor, VideoId};

/// Read access to the video catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look a video up by id.
    async fn video(&self, id: VideoId) -> Result<Option<VideoDescriptor>>;

    /// The video following `id` in its playlist, if any.
    async fn next_in_playlist(&self, id: VideoId) -> Result<Option<VideoDescriptor>>;
}

/// Sort key of a title: leading number (absent sorts last), then lowercase text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TitleKey {
    unnumbered: bool,
    number: u64,
    folded: String,
}

impl TitleKey {
    pub fn new(title: &str) -> Self {
        let digits: &str = {
            let end = title
                .char_indices()
                .find(|(_, c)| !c.is_ascii_digit())
                .map(|(i, _)| i)
                .unwrap_or(title.len());
            &title[..end]
        };
        let number = digits.bytes().fold(0u64, |acc, b| {
            acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
        });
        Self {
            unnumbered: digits.is_empty(),
            number,
            folded: title.to_lowercase(),
        }
    }
}

/// Playlist comparison of two titles.
///
/// Titles equal under the key fall back to a plain comparison so the order
/// is total and stable.
pub fn compare_titles(a: &str, b: &str) -> Ordering {
    TitleKey::new(a).cmp(&TitleKey::new(b)).then_with(|| a.cmp(b))
}

/// Sort videos into playlist order.
pub fn sort_playlist(videos: &mut [VideoDescriptor]) {
    videos.sort_by(|a, b| compare_titles(&a.title, &b.title).then_with(|| a.id.cmp(&b.id)));
}

/// The first video of `candidates` ordered strictly after `current`.
///
/// Only videos of the same category count. "After" uses [`TitleKey`] alone,
/// so a title equal to the current one under the key is never next.
pub fn next_after<'a, I>(current: &VideoDescriptor, candidates: I) -> Option<&'a VideoDescriptor>
where
    I: IntoIterator<Item = &'a VideoDescriptor>,
{
    let current_key = TitleKey::new(&current.title);
    candidates
        .into_iter()
        .filter(|v| v.category_id == current.category_id && v.id != current.id)
        .map(|v| (TitleKey::new(&v.title), v))
        .filter(|(key, _)| *key > current_key)
        .min_by(|(ka, a), (kb, b)| ka.cmp(kb).then_with(|| a.title.cmp(&b.title)))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: u64, category: u64, title: &str) -> VideoDescriptor {
        VideoDescriptor::new(id, category, title, format!("/{}", title), 1)
    }

    #[test]
    fn test_numeric_aware_ordering() {
        let mut titles = vec!["Bonus", "10 - Finale", "2 - Intro"];
        titles.sort_by(|a, b| compare_titles(a, b));
        assert_eq!(titles, vec!["2 - Intro", "10 - Finale", "Bonus"]);
    }

    #[test]
    fn test_numbered_ties_compare_case_insensitively() {
        assert_eq!(compare_titles("3 b", "3 A"), Ordering::Greater);
        assert_eq!(compare_titles("03 Zebra", "3 apple"), Ordering::Less);
        assert_eq!(compare_titles("apple", "Banana"), Ordering::Less);
    }

    #[test]
    fn test_huge_numbers_saturate() {
        let key = TitleKey::new("99999999999999999999999 - long");
        assert_eq!(key.number, u64::MAX);
        assert_eq!(compare_titles("99999999999999999999999", "Bonus"), Ordering::Less);
    }

    #[test]
    fn test_next_after_stays_in_category() {
        let videos = vec![
            v(1, 1, "1 - Morning"),
            v(2, 1, "2 - Lunch"),
            v(3, 2, "1 - Other playlist"),
            v(4, 1, "10 - Night"),
            v(5, 1, "Extras"),
        ];
        assert_eq!(next_after(&videos[0], &videos).map(|v| v.id), Some(VideoId(2)));
        assert_eq!(next_after(&videos[1], &videos).map(|v| v.id), Some(VideoId(4)));
        assert_eq!(next_after(&videos[3], &videos).map(|v| v.id), Some(VideoId(5)));
        assert_eq!(next_after(&videos[4], &videos), None);
        assert_eq!(next_after(&videos[2], &videos), None);
    }

    #[test]
    fn test_sort_playlist() {
        let mut videos = vec![v(1, 1, "Bonus"), v(2, 1, "10 - Finale"), v(3, 1, "2 - Intro")];
        sort_playlist(&mut videos);
        let ids: Vec<u64> = videos.iter().map(|v| v.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
