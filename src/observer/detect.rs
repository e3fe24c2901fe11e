use std::time::{Duration, Instant};
use url::Url;

/// Hosts that serve the short-form player.
pub const PLATFORM_HOSTS: &[&str] = &["www.youtube.com", "youtube.com", "m.youtube.com"];
const SHORT_FORM_SEGMENT: &str = "shorts";
/// Longest gap between progress changes still read as "playing".
pub const PROGRESS_STALL: Duration = Duration::from_millis(1500);
/// `HTMLMediaElement.readyState` at which the current frame is playable.
const HAVE_FUTURE_DATA: u8 = 3;

/// State of the page's video element, as read by the page script.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaState {
    pub paused: bool,
    pub ended: bool,
    pub ready_state: u8,
    pub current_time: f64,
    pub duration: f64,
}

/// One sample of everything the observer decides on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageSnapshot {
    pub url: String,
    /// Whether the short-form player element is in the DOM.
    pub has_short_player: bool,
    pub hidden: bool,
    pub focused: bool,
    pub media: Option<MediaState>,
    pub play_button_label: Option<String>,
    /// Progress indicator position in seconds, when the page shows one.
    pub progress: Option<f64>,
}

impl PageSnapshot {
    /// Visible and focused.
    pub fn active(&self) -> bool {
        !self.hidden && self.focused
    }

    pub fn position(&self) -> Option<f64> {
        self.media
            .map(|media| media.current_time)
            .or(self.progress)
    }
}

/// URL half of the qualification check: a `/shorts/<id>` page on the
/// platform. Feed and home pages never qualify.
pub fn is_short_form_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let on_platform = parsed
        .host_str()
        .is_some_and(|host| PLATFORM_HOSTS.iter().any(|known| host.eq_ignore_ascii_case(known)));
    if !on_platform {
        return false;
    }
    let Some(mut segments) = parsed.path_segments() else {
        return false;
    };
    if segments.next() != Some(SHORT_FORM_SEGMENT) {
        return false;
    }
    let id = segments.next().unwrap_or_default();
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Decides whether a page is a short-form content view. The URL alone is not
/// enough: the player must be present too.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentQualifier;

impl ContentQualifier {
    pub fn qualifies(&self, page: &PageSnapshot) -> bool {
        page.has_short_player && is_short_form_url(&page.url)
    }
}

/// A technique for telling whether the player is advancing. Uncertainty
/// reads as "not playing".
pub trait PlaybackDetector: Send {
    fn is_playing(&mut self, page: &PageSnapshot, now: Instant) -> bool;

    /// Forgets sampled history, e.g. after navigation.
    fn reset(&mut self) {}
}

/// Reads the video element's own flags.
#[derive(Debug, Default)]
pub struct MediaElement;

impl PlaybackDetector for MediaElement {
    fn is_playing(&mut self, page: &PageSnapshot, _now: Instant) -> bool {
        page.media.is_some_and(|media| {
            !media.paused && !media.ended && media.ready_state >= HAVE_FUTURE_DATA
        })
    }
}

/// The play/pause affordance offers "Pause" while the video plays.
#[derive(Debug, Default)]
pub struct PlayButtonLabel;

impl PlaybackDetector for PlayButtonLabel {
    fn is_playing(&mut self, page: &PageSnapshot, _now: Instant) -> bool {
        page.play_button_label
            .as_deref()
            .is_some_and(|label| label.to_ascii_lowercase().contains("pause"))
    }
}

/// Watches the progress indicator move forward; a stall longer than
/// [`PROGRESS_STALL`] counts as paused. Backward jumps are not progress.
#[derive(Debug, Default)]
pub struct ProgressAdvance {
    last_value: Option<f64>,
    last_moved_at: Option<Instant>,
}

impl PlaybackDetector for ProgressAdvance {
    fn is_playing(&mut self, page: &PageSnapshot, now: Instant) -> bool {
        let Some(value) = page.position() else {
            self.reset();
            return false;
        };
        if let Some(previous) = self.last_value {
            if value > previous {
                self.last_moved_at = Some(now);
            }
        }
        self.last_value = Some(value);
        self.last_moved_at
            .is_some_and(|moved| now.saturating_duration_since(moved) <= PROGRESS_STALL)
    }

    fn reset(&mut self) {
        self.last_value = None;
        self.last_moved_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionStrategy {
    #[default]
    MediaElement,
    PlayButtonLabel,
    ProgressAdvance,
}

impl DetectionStrategy {
    pub fn detector(self) -> Box<dyn PlaybackDetector> {
        match self {
            DetectionStrategy::MediaElement => Box::new(MediaElement),
            DetectionStrategy::PlayButtonLabel => Box::new(PlayButtonLabel),
            DetectionStrategy::ProgressAdvance => Box::<ProgressAdvance>::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_urls_need_an_id_on_the_platform() {
        assert!(is_short_form_url("https://www.youtube.com/shorts/dQw4w9WgXcQ"));
        assert!(is_short_form_url("https://m.youtube.com/shorts/abc_DEF-123?feature=share"));
        assert!(is_short_form_url("http://YouTube.com/shorts/abc/"));

        assert!(!is_short_form_url("https://www.youtube.com/"));
        assert!(!is_short_form_url("https://www.youtube.com/shorts/"));
        assert!(!is_short_form_url("https://www.youtube.com/shorts"));
        assert!(!is_short_form_url("https://www.youtube.com/feed/subscriptions"));
        assert!(!is_short_form_url("https://www.youtube.com/watch?v=shorts"));
        assert!(!is_short_form_url("https://example.com/shorts/abc"));
        assert!(!is_short_form_url("https://www.youtube.com.evil.test/shorts/abc"));
        assert!(!is_short_form_url("ftp://www.youtube.com/shorts/abc"));
        assert!(!is_short_form_url("https://user@evil.test:443/shorts/abc"));
        assert!(!is_short_form_url("https://www.youtube.com/shorts/abc def"));
        assert!(!is_short_form_url("not a url"));
    }

    #[test]
    fn qualifier_requires_player_dom() {
        let mut page = PageSnapshot {
            url: "https://www.youtube.com/shorts/abc".to_string(),
            ..Default::default()
        };
        assert!(!ContentQualifier.qualifies(&page));
        page.has_short_player = true;
        assert!(ContentQualifier.qualifies(&page));
    }

    #[test]
    fn media_element_needs_playable_unpaused_video() {
        let now = Instant::now();
        let mut detector = MediaElement;
        let mut page = PageSnapshot {
            media: Some(MediaState {
                paused: false,
                ended: false,
                ready_state: 4,
                current_time: 3.0,
                duration: 20.0,
            }),
            ..Default::default()
        };
        assert!(detector.is_playing(&page, now));

        page.media.as_mut().unwrap().ready_state = 2;
        assert!(!detector.is_playing(&page, now));
        page.media = None;
        assert!(!detector.is_playing(&page, now));
    }

    #[test]
    fn button_label_reads_pause_affordance() {
        let now = Instant::now();
        let mut detector = PlayButtonLabel;
        let mut page = PageSnapshot {
            play_button_label: Some("Pause (k)".to_string()),
            ..Default::default()
        };
        assert!(detector.is_playing(&page, now));
        page.play_button_label = Some("Play (k)".to_string());
        assert!(!detector.is_playing(&page, now));
    }

    #[test]
    fn progress_stall_reads_as_paused() {
        let start = Instant::now();
        let mut detector = ProgressAdvance::default();
        let mut page = PageSnapshot {
            progress: Some(1.0),
            ..Default::default()
        };
        // One sample is not evidence of movement.
        assert!(!detector.is_playing(&page, start));

        page.progress = Some(2.0);
        assert!(detector.is_playing(&page, start + Duration::from_secs(1)));
        assert!(detector.is_playing(&page, start + Duration::from_millis(2400)));
        assert!(!detector.is_playing(&page, start + Duration::from_millis(2600)));

        page.progress = Some(3.0);
        assert!(detector.is_playing(&page, start + Duration::from_secs(3)));
    }

    #[test]
    fn progress_moving_backwards_is_not_playback() {
        let start = Instant::now();
        let mut detector = ProgressAdvance::default();
        let mut page = PageSnapshot {
            progress: Some(10.0),
            ..Default::default()
        };
        assert!(!detector.is_playing(&page, start));

        // Seeking back, sampled repeatedly, never reads as advancing.
        page.progress = Some(4.0);
        assert!(!detector.is_playing(&page, start + Duration::from_secs(1)));
        page.progress = Some(0.5);
        assert!(!detector.is_playing(&page, start + Duration::from_secs(2)));

        page.progress = Some(1.5);
        assert!(detector.is_playing(&page, start + Duration::from_secs(3)));
    }
}
