//! Report episodes missing from Jellyfin's library.
//!
//! Jellyfin knows about aired episodes it has no file for, but doesn't
//! surface them well. This walks every continuing series newest-first and
//! reports the run of missing, unwatched episodes at the top; the scan stops
//! at the first episode that is present or watched, so deleting season 1
//! while watching season 2 doesn't cause constant pestering.

use std::io::Write;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

/// Cap per-series output so one series can't fill the screen
const MAX_REPORTED_EPISODES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Episode {
    #[serde(rename = "Type", default)]
    pub kind: String,
    pub name: Option<String>,
    pub series_name: Option<String>,
    pub season_name: Option<String>,
    pub parent_index_number: Option<i64>,
    pub index_number: Option<i64>,
    pub premiere_date: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub user_data: UserData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserData {
    #[serde(rename = "Played", default)]
    pub played: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Series {
    #[serde(rename = "Type", default)]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub external_urls: Vec<ExternalUrl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalUrl {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ItemsPage<T> {
    #[serde(rename = "Items")]
    items: Vec<T>,
}

impl Episode {
    /// A season-00 special, usually non-canon behind-the-scenes stuff.
    pub fn is_special(&self) -> bool {
        self.parent_index_number == Some(0) && self.season_name.as_deref() == Some("Specials")
    }

    /// Missing means no file on disk; unwatched tracks the querying user.
    pub fn is_missing(&self) -> bool {
        self.path.is_none()
    }

    pub fn premiere(&self) -> Option<NaiveDate> {
        let raw = self.premiere_date.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.date_naive())
            .ok()
    }
}

/// Sort newest-first: premiere date, then season and episode number.
pub fn sort_newest_first(episodes: &mut [Episode]) {
    episodes.sort_by_key(|e| {
        std::cmp::Reverse((
            e.premiere(),
            e.parent_index_number.unwrap_or(0),
            e.index_number.unwrap_or(0),
        ))
    });
}

/// Walking from the newest episode backwards, collect the run of missing,
/// unwatched episodes. Stops at the first episode that is present or has
/// been watched, assuming everything older was seen.
pub fn missing_run(sorted_newest_first: &[Episode]) -> Vec<&Episode> {
    let mut missing = Vec::new();
    for episode in sorted_newest_first {
        if episode.is_missing() && !episode.user_data.played {
            // Insert at the front to invert the reversed sort; it just
            // reads better oldest-first.
            missing.insert(0, episode);
        } else {
            break;
        }
    }
    missing
}

/// A torrent-search URL for the series: derived from its IMDb ID when
/// Jellyfin knows it, otherwise a plain title search.
pub fn rarbg_url(series: &Series) -> String {
    let imdb = series
        .external_urls
        .iter()
        .find(|e| e.name == "IMDb")
        .map(|e| e.url.as_str());

    match imdb {
        Some(imdb_url) => {
            let imdb_id = imdb_url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
            // The trailing slash matters, without it the site 404s
            format!("http://rarbg.to/tv/{}/", imdb_id)
        }
        None => {
            url::Url::parse_with_params("http://rarbg.to/torrents.php", [("search", &series.name)])
                .map(|url| url.to_string())
                .unwrap_or_else(|_| "http://rarbg.to/torrents.php".to_string())
        }
    }
}

/// Write the per-series report block.
pub fn format_report(
    series: &Series,
    missing: &[&Episode],
    total_episodes: usize,
    out: &mut impl Write,
) -> std::io::Result<()> {
    if missing.is_empty() {
        return Ok(());
    }

    writeln!(out, "{} ({})", series.name, rarbg_url(series))?;

    if missing.len() == total_episodes {
        writeln!(out, "* All episodes missing.")?;
        writeln!(out, "* Have the episodes been deleted without the series itself?")?;
        return Ok(());
    }

    for (count, episode) in missing.iter().enumerate() {
        if count >= MAX_REPORTED_EPISODES {
            writeln!(
                out,
                "* ... and {} more",
                missing.len() - MAX_REPORTED_EPISODES
            )?;
            break;
        }

        writeln!(
            out,
            "* {} - S{:02}E{:02} - {}  (Premiered: {})",
            episode.season_name.as_deref().unwrap_or(""),
            episode.parent_index_number.unwrap_or(0),
            episode.index_number.unwrap_or(0),
            episode.name.as_deref().unwrap_or(""),
            episode
                .premiere()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )?;
    }

    Ok(())
}

/// CLI arguments for the jellyfin-missing subcommand
#[derive(Debug, clap::Args)]
#[command(group(
    clap::ArgGroup::new("auth").required(true).args(["token", "token_file"])
))]
pub struct JellyfinArgs {
    /// Jellyfin's base URL
    #[arg(long, default_value = "http://media/")]
    pub base_url: String,

    /// User ID to check for watched status
    #[arg(long)]
    pub user_id: String,

    /// Ignore episodes in season 00, usually non-canon behind-the-scenes
    /// stuff or Christmas specials
    #[arg(long)]
    pub ignore_specials: bool,

    /// Jellyfin API key to use
    #[arg(long)]
    pub token: Option<String>,

    /// File to read the Jellyfin API key from
    #[arg(long)]
    pub token_file: Option<PathBuf>,
}

impl JellyfinArgs {
    pub fn api_key(&self) -> anyhow::Result<String> {
        match (&self.token, &self.token_file) {
            (Some(token), _) => {
                warn!("It is recommended you use --token-file instead of --token");
                Ok(token.clone())
            }
            (None, Some(path)) => Ok(std::fs::read_to_string(path)?.trim().to_string()),
            (None, None) => anyhow::bail!("either --token or --token-file is required"),
        }
    }
}

pub struct JellyfinClient {
    base_url: String,
    api_key: String,
    user_id: String,
    client: reqwest::Client,
}

impl JellyfinClient {
    pub fn new(base_url: impl Into<String>, api_key: String, user_id: String) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Self {
            base_url,
            api_key,
            user_id,
            client: reqwest::Client::new(),
        }
    }

    async fn items<T: for<'de> Deserialize<'de>>(
        &self,
        extra_query: &[(&str, &str)],
    ) -> anyhow::Result<Vec<T>> {
        let url = url::Url::parse(&self.base_url)?.join("Items")?;

        // Nothing runs *as* this user; it scopes the query to the library
        // items the user can see, plus their watched state.
        let mut query: Vec<(&str, &str)> = vec![
            ("userId", self.user_id.as_str()),
            ("enableImages", "false"),
            ("recursive", "true"),
        ];
        query.extend_from_slice(extra_query);

        let page: ItemsPage<T> = self
            .client
            .get(url)
            .query(&query)
            .header("accept", "application/json")
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page.items)
    }

    /// Every aired episode the user can see.
    ///
    /// Missing episodes get no parentId and can't be searched by seriesId,
    /// so the only reliable way to find them is to fetch all episodes and
    /// group client-side.
    pub async fn aired_episodes(&self) -> anyhow::Result<Vec<Episode>> {
        self.items(&[
            ("includeItemTypes", "Episode"),
            ("isUnaired", "false"),
            // To determine whether we already have the file
            ("fields", "Path"),
        ])
        .await
    }

    /// Continuing series only; ended series can't grow new episodes.
    pub async fn continuing_series(&self) -> anyhow::Result<Vec<Series>> {
        self.items(&[
            ("includeItemTypes", "Series"),
            ("seriesStatus", "Continuing"),
            // For IMDb IDs
            ("fields", "ExternalUrls"),
        ])
        .await
    }
}

pub async fn run(args: &JellyfinArgs) -> anyhow::Result<()> {
    let api_key = args.api_key()?;
    let client = JellyfinClient::new(args.base_url.clone(), api_key, args.user_id.clone());

    let mut episodes_by_series: std::collections::HashMap<String, Vec<Episode>> =
        std::collections::HashMap::new();
    for episode in client.aired_episodes().await? {
        if episode.kind != "Episode" {
            continue;
        }
        if args.ignore_specials && episode.is_special() {
            continue;
        }
        let Some(series_name) = episode.series_name.clone() else {
            continue;
        };
        episodes_by_series.entry(series_name).or_default().push(episode);
    }

    let mut series_list = client.continuing_series().await?;
    series_list.retain(|s| s.kind == "Series");
    // Alphabetical order reads better than API order
    series_list.sort_by(|a, b| a.name.cmp(&b.name));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for series in &series_list {
        let Some(episodes) = episodes_by_series.get_mut(&series.name) else {
            continue;
        };
        sort_newest_first(episodes);
        let missing = missing_run(episodes);
        format_report(series, &missing, episodes.len(), &mut out)?;
    }

    Ok(())
}
