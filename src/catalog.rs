//! Built-in extraction jobs of the Steam/YouTube pipeline.
//!
//! Each entry names its upstream work list, the dataset it feeds and the
//! credentials it needs. Jobs without a default URL template (scraping and
//! image analysis) take one from `--url-template`, typically a local service.

use crate::config::HarvestPaths;
use crate::remote::RemoteSync;
use crate::util::env::env_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSpec {
    pub name: &'static str,
    pub about: &'static str,
    /// File names under the raw data directory, concatenated in order.
    pub sources: &'static [&'static str],
    pub dataset: &'static str,
    pub url_template: Option<&'static str>,
    /// Key of the response body inside the output record.
    pub field: &'static str,
    /// Payload list whose ids fill a `{refs}` template.
    pub refs_field: Option<&'static str>,
    /// Query parameter filled from an environment key: `(param, env_key)`.
    pub query_secret: Option<(&'static str, &'static str)>,
    pub required_env: &'static [&'static str],
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

pub const CATALOG: &[JobSpec] = &[
    JobSpec {
        name: "details",
        about: "Steam store details per app id",
        sources: &["appids_list.json.gz"],
        dataset: "games_info.jsonl.gz",
        url_template: Some("https://store.steampowered.com/api/appdetails?appids={id}&cc=eur&l=spanish"),
        field: "appdetails",
        refs_field: None,
        query_secret: None,
        required_env: &[],
        delay_ms: 1500,
        jitter_ms: 0,
    },
    JobSpec {
        name: "video-search",
        about: "YouTube search results per game",
        sources: &["games_info.jsonl.gz"],
        dataset: "info_steam_youtube1.jsonl.gz",
        url_template: None,
        field: "video_statistics",
        refs_field: None,
        query_secret: None,
        required_env: &[],
        delay_ms: 2000,
        jitter_ms: 2000,
    },
    JobSpec {
        name: "video-stats",
        about: "YouTube statistics per video",
        sources: &["info_steam_youtube1.jsonl.gz"],
        dataset: "youtube_statistics.jsonl.gz",
        // one request per game, for the video ids its search result lists
        url_template: Some("https://www.googleapis.com/youtube/v3/videos?part=statistics&id={refs}"),
        field: "statistics",
        refs_field: Some("video_statistics"),
        query_secret: Some(("key", "API_KEY_YT")),
        required_env: &["API_KEY_YT"],
        delay_ms: 0,
        jitter_ms: 0,
    },
    JobSpec {
        name: "reviews",
        about: "Steam user reviews per game",
        sources: &["top_100_games_total_reviews.json.gz", "rest_games_total_reviews.json.gz"],
        dataset: "steam_reviews.json.gz",
        url_template: Some("https://store.steampowered.com/appreviews/{id}?json=1&language=all&num_per_page=100"),
        field: "reviews",
        refs_field: None,
        query_secret: None,
        required_env: &[],
        delay_ms: 1000,
        jitter_ms: 500,
    },
    JobSpec {
        name: "image-features",
        about: "Banner image features per game",
        sources: &["games_info.jsonl.gz"],
        dataset: "info_imagenes.jsonl.gz",
        url_template: None,
        field: "image_features",
        refs_field: None,
        query_secret: None,
        required_env: &[],
        delay_ms: 0,
        jitter_ms: 0,
    },
];

pub fn find(name: &str) -> Option<&'static JobSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

pub fn names() -> Vec<&'static str> {
    CATALOG.iter().map(|spec| spec.name).collect()
}

/// One prerequisite of a job and whether it is met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub label: String,
    pub ok: bool,
}

impl JobSpec {
    /// Source files present (locally or on the remote) and credentials set.
    pub async fn check_dependencies(
        &self,
        paths: &HarvestPaths,
        remote: Option<&dyn RemoteSync>,
    ) -> Vec<Dependency> {
        let mut out = Vec::with_capacity(self.sources.len() + self.required_env.len());
        for name in self.sources {
            let mut ok = paths.raw(name).is_file();
            if !ok {
                if let Some(remote) = remote {
                    ok = remote.exists(name).await;
                }
            }
            out.push(Dependency {
                label: format!("file {name}"),
                ok,
            });
        }
        for key in self.required_env {
            out.push(Dependency {
                label: format!("env {key}"),
                ok: env_opt(key).is_some(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DirectoryRemote;
    use crate::session::DatasetFormat;
    use std::path::Path;

    #[test]
    fn names_are_unique_and_files_have_known_formats() {
        let mut names = names();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
        for spec in CATALOG {
            assert!(DatasetFormat::from_path(Path::new(spec.dataset)).is_some(), "{}", spec.name);
            for source in spec.sources {
                assert!(DatasetFormat::from_path(Path::new(source)).is_some(), "{source}");
            }
            if let Some(t) = spec.url_template {
                assert!(t.contains("{id}") || t.contains("{refs}"), "{}", spec.name);
                assert_eq!(t.contains("{refs}"), spec.refs_field.is_some(), "{}", spec.name);
            }
        }
    }

    #[test]
    fn video_stats_reads_video_ids_from_search_results() {
        let search = find("video-search").unwrap();
        let stats = find("video-stats").unwrap();
        assert_eq!(stats.sources, &[search.dataset]);
        assert_eq!(stats.refs_field, Some(search.field));
        assert!(!stats.url_template.unwrap().contains("{id}"));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(find("reviews").map(|s| s.dataset), Some("steam_reviews.json.gz"));
        assert!(find("listing").is_none());
    }

    #[tokio::test]
    async fn sources_found_on_remote_count_as_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HarvestPaths::new(dir.path().join("data"), dir.path().join("config"));
        let spec = find("details").unwrap();

        let deps = spec.check_dependencies(&paths, None).await;
        assert_eq!(deps, vec![Dependency { label: "file appids_list.json.gz".into(), ok: false }]);

        let bucket = dir.path().join("bucket");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("appids_list.json.gz"), b"").unwrap();
        let remote = DirectoryRemote::new(bucket);
        let deps = spec
            .check_dependencies(&paths, Some(&remote as &dyn RemoteSync))
            .await;
        assert!(deps.iter().all(|d| d.ok));
    }
}
