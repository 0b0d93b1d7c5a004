//! Automatic interaction detection.
//!
//! The host forwards raw DOM notifications as [`DomEvent`]s. Each kind is
//! routed through a subscription table to heuristic handlers that turn
//! interactions into classified [`Detection`]s.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use crate::core::{Classification, Properties};

static DOWNLOAD_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(pdf|zip|doc|xls|ppt)$").expect("invalid download regex"));

const HIGH_VALUE_BUTTON_TERMS: &[&str] = &["buy", "purchase", "checkout", "subscribe"];
const MEDIUM_VALUE_BUTTON_TERMS: &[&str] = &["add to cart", "sign up", "register"];
const HIGH_VALUE_FORM_TERMS: &[&str] = &["checkout", "payment"];

const RAGE_CLICK_THRESHOLD: usize = 5;
const RAGE_CLICK_WINDOW_MS: u64 = 2000;
const SCROLL_MILESTONES: [u8; 4] = [25, 50, 75, 100];
const VIDEO_MILESTONES: [u8; 3] = [25, 50, 75];

/// Snapshot of the element an interaction targeted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementInfo {
    pub tag: String,
    pub id: String,
    pub class_name: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

impl ElementInfo {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn is_tag(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    fn has_class(&self, class: &str) -> bool {
        self.class_name.split_whitespace().any(|c| c == class)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormInfo {
    pub id: String,
    pub name: String,
    pub action: String,
}

impl FormInfo {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            action: action.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A video element, keyed by its source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoInfo {
    pub src: String,
    pub title: String,
}

impl VideoInfo {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            title: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddedNode {
    Video(VideoInfo),
    Element(ElementInfo),
}

/// Host notification forwarded to the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    Click {
        target: ElementInfo,
        /// Host clock in milliseconds.
        at_ms: u64,
    },
    Submit {
        form: FormInfo,
    },
    FocusIn {
        target: ElementInfo,
        form: Option<FormInfo>,
    },
    Scroll {
        scroll_y: f64,
        viewport_height: f64,
        document_height: f64,
    },
    VideoPlay {
        video: VideoInfo,
    },
    VideoTimeUpdate {
        video: VideoInfo,
        current_time: f64,
        duration: f64,
    },
    NodesAdded {
        nodes: Vec<AddedNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomEventKind {
    Click,
    Submit,
    FocusIn,
    Scroll,
    VideoPlay,
    VideoTimeUpdate,
    NodesAdded,
}

impl DomEvent {
    pub fn kind(&self) -> DomEventKind {
        match self {
            DomEvent::Click { .. } => DomEventKind::Click,
            DomEvent::Submit { .. } => DomEventKind::Submit,
            DomEvent::FocusIn { .. } => DomEventKind::FocusIn,
            DomEvent::Scroll { .. } => DomEventKind::Scroll,
            DomEvent::VideoPlay { .. } => DomEventKind::VideoPlay,
            DomEvent::VideoTimeUpdate { .. } => DomEventKind::VideoTimeUpdate,
            DomEvent::NodesAdded { .. } => DomEventKind::NodesAdded,
        }
    }
}

/// A classified interaction, ready to become an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub event_type: &'static str,
    pub event_name: &'static str,
    pub classification: Classification,
    /// Always within 0..=100.
    pub confidence: u8,
    pub properties: Properties,
}

impl Detection {
    fn new(
        event_type: &'static str,
        event_name: &'static str,
        classification: Classification,
        confidence: u8,
        properties: Value,
    ) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Properties::new(),
        };
        Self {
            event_type,
            event_name,
            classification,
            confidence: confidence.min(100),
            properties,
        }
    }
}

type Handler = fn(&mut DetectorState, &DomEvent, &mut Vec<Detection>);

#[derive(Default)]
struct DetectorState {
    recent_clicks: VecDeque<u64>,
    started_forms: HashSet<String>,
    scroll_reached: HashSet<u8>,
    observed_videos: HashSet<String>,
    video_progress: HashMap<String, HashSet<u8>>,
    pending_nodes: Vec<AddedNode>,
}

/// Routes host notifications to interaction heuristics.
pub struct EventDetector {
    subscriptions: HashMap<DomEventKind, Vec<Handler>>,
    state: DetectorState,
}

impl Default for EventDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDetector {
    pub fn new() -> Self {
        let mut detector = Self {
            subscriptions: HashMap::new(),
            state: DetectorState::default(),
        };
        detector.subscribe(DomEventKind::Click, on_click);
        detector.subscribe(DomEventKind::Click, on_rage_click);
        detector.subscribe(DomEventKind::Submit, on_submit);
        detector.subscribe(DomEventKind::FocusIn, on_focus_in);
        detector.subscribe(DomEventKind::Scroll, on_scroll);
        detector.subscribe(DomEventKind::VideoPlay, on_video_play);
        detector.subscribe(DomEventKind::VideoTimeUpdate, on_video_time_update);
        detector.subscribe(DomEventKind::NodesAdded, on_nodes_added);
        detector
    }

    fn subscribe(&mut self, kind: DomEventKind, handler: Handler) {
        self.subscriptions.entry(kind).or_default().push(handler);
    }

    pub fn handle(&mut self, event: &DomEvent) -> Vec<Detection> {
        let mut detections = Vec::new();
        let Some(handlers) = self.subscriptions.get(&event.kind()) else {
            return detections;
        };
        for handler in handlers {
            handler(&mut self.state, event, &mut detections);
        }
        detections
    }

    /// Processes mutations queued since the last idle period. Returns the
    /// number of newly observed videos.
    pub fn run_idle(&mut self) -> usize {
        let mut observed = 0;
        for node in std::mem::take(&mut self.state.pending_nodes) {
            if let AddedNode::Video(video) = node
                && self.state.observed_videos.insert(video.src)
            {
                observed += 1;
            }
        }
        observed
    }

    /// Starts tracking a video already present in the page.
    pub fn observe_video(&mut self, video: &VideoInfo) {
        self.state.observed_videos.insert(video.src.clone());
    }

    pub fn is_observing(&self, video: &VideoInfo) -> bool {
        self.state.observed_videos.contains(&video.src)
    }

    pub fn teardown(&mut self) {
        self.subscriptions.clear();
        self.state.pending_nodes.clear();
    }

    pub fn subscribed_kinds(&self) -> Vec<DomEventKind> {
        self.subscriptions.keys().copied().collect()
    }
}

fn on_click(_state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::Click { target, .. } = event else {
        return;
    };

    if is_button(target) {
        out.push(classify_button(target));
    }
    if let Some(href) = link_href(target) {
        out.push(classify_link(target, href));
    }
}

fn on_rage_click(state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::Click { at_ms, .. } = event else {
        return;
    };

    state.recent_clicks.push_back(*at_ms);
    while let Some(&first) = state.recent_clicks.front()
        && at_ms.saturating_sub(first) >= RAGE_CLICK_WINDOW_MS
    {
        state.recent_clicks.pop_front();
    }

    if state.recent_clicks.len() >= RAGE_CLICK_THRESHOLD {
        out.push(Detection::new(
            "interaction",
            "rage_click",
            Classification::Medium,
            80,
            json!({ "click_count": state.recent_clicks.len() }),
        ));
        state.recent_clicks.clear();
    }
}

fn on_submit(_state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::Submit { form } = event else {
        return;
    };

    let action = form.action.to_lowercase();
    let id = form.id.to_lowercase();
    let classification = if contains_any(&action, HIGH_VALUE_FORM_TERMS)
        || contains_any(&id, HIGH_VALUE_FORM_TERMS)
    {
        Classification::High
    } else {
        Classification::Medium
    };

    out.push(Detection::new(
        "form",
        "form_submit",
        classification,
        85,
        json!({
            "form_id": form.id,
            "form_name": form.name,
            "form_action": form.action,
        }),
    ));
}

fn on_focus_in(state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::FocusIn {
        target,
        form: Some(form),
    } = event
    else {
        return;
    };
    if !(target.is_tag("input") || target.is_tag("textarea")) {
        return;
    }
    if !state.started_forms.insert(form.id.clone()) {
        return;
    }

    out.push(Detection::new(
        "form",
        "form_start",
        Classification::Medium,
        75,
        json!({ "form_id": form.id, "form_name": form.name }),
    ));
}

fn on_scroll(state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::Scroll {
        scroll_y,
        viewport_height,
        document_height,
    } = event
    else {
        return;
    };
    if *document_height <= 0.0 {
        return;
    }

    let percent = (scroll_y + viewport_height) / document_height * 100.0;
    for milestone in SCROLL_MILESTONES {
        if percent >= f64::from(milestone) && state.scroll_reached.insert(milestone) {
            out.push(Detection::new(
                "scroll",
                "scroll_depth",
                Classification::Low,
                95,
                json!({ "depth": milestone }),
            ));
        }
    }
}

fn on_video_play(state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::VideoPlay { video } = event else {
        return;
    };
    if !state.observed_videos.contains(&video.src) {
        return;
    }

    out.push(Detection::new(
        "video",
        "video_play",
        Classification::Medium,
        90,
        json!({ "video_url": video.src, "video_title": video.title }),
    ));
}

fn on_video_time_update(state: &mut DetectorState, event: &DomEvent, out: &mut Vec<Detection>) {
    let DomEvent::VideoTimeUpdate {
        video,
        current_time,
        duration,
    } = event
    else {
        return;
    };
    if !state.observed_videos.contains(&video.src) || !duration.is_finite() || *duration <= 0.0 {
        return;
    }

    let percent = current_time / duration * 100.0;
    let reached = state.video_progress.entry(video.src.clone()).or_default();
    for milestone in VIDEO_MILESTONES {
        if percent >= f64::from(milestone) && reached.insert(milestone) {
            out.push(Detection::new(
                "video",
                "video_progress",
                Classification::Medium,
                85,
                json!({ "progress": milestone, "video_url": video.src }),
            ));
        }
    }
}

fn on_nodes_added(state: &mut DetectorState, event: &DomEvent, _out: &mut Vec<Detection>) {
    if let DomEvent::NodesAdded { nodes } = event {
        state.pending_nodes.extend(nodes.iter().cloned());
    }
}

fn is_button(element: &ElementInfo) -> bool {
    element.is_tag("button")
        || (element.is_tag("a") && element.has_class("btn"))
        || element.attr("role") == Some("button")
}

fn link_href(element: &ElementInfo) -> Option<&str> {
    if !element.is_tag("a") {
        return None;
    }
    element.attr("href").filter(|href| !href.is_empty())
}

fn classify_button(button: &ElementInfo) -> Detection {
    let text = button.text.to_lowercase();
    let (classification, confidence) = if contains_any(&text, HIGH_VALUE_BUTTON_TERMS) {
        (Classification::High, 90)
    } else if contains_any(&text, MEDIUM_VALUE_BUTTON_TERMS) {
        (Classification::Medium, 85)
    } else {
        (Classification::Low, 70)
    };

    Detection::new(
        "click",
        "button_click",
        classification,
        confidence,
        json!({ "button_text": button.text, "button_id": button.id }),
    )
}

fn classify_link(link: &ElementInfo, href: &str) -> Detection {
    if link.attr("download").is_some() || DOWNLOAD_EXTENSION.is_match(href) {
        let file_type = href.rsplit('.').next().unwrap_or_default();
        return Detection::new(
            "click",
            "file_download",
            Classification::High,
            95,
            json!({ "file_url": href, "file_type": file_type }),
        );
    }

    Detection::new(
        "click",
        "link_click",
        Classification::Low,
        75,
        json!({ "link_url": href, "link_text": link.text }),
    )
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
