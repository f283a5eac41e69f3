use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::LogEntry;

/// Delay field dialect, picked once per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtaFamily {
    Postfix,
    Exim
}

impl MtaFamily {
    /// Stages in the order the message passes through them.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::Postfix => &[
                Stage::BeforeQmgr,
                Stage::InQmgr,
                Stage::ConnSetup,
                Stage::Transmission,
            ],
            Self::Exim => &[Stage::Receive, Stage::QueueWait, Stage::Deliver]
        }
    }
}

/// First entry whose service names an MTA decides, postfix otherwise.
pub fn detect_family<'a, I>(entries: I) -> MtaFamily
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    for entry in entries {
        let service = entry.service.to_ascii_lowercase();
        if service.contains("postfix") {
            return MtaFamily::Postfix;
        }
        if service.contains("exim") {
            return MtaFamily::Exim;
        }
    }
    MtaFamily::Postfix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    BeforeQmgr,
    InQmgr,
    ConnSetup,
    Transmission,
    Receive,
    QueueWait,
    Deliver
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeQmgr => "before_qmgr",
            Self::InQmgr => "in_qmgr",
            Self::ConnSetup => "conn_setup",
            Self::Transmission => "transmission",
            Self::Receive => "receive",
            Self::QueueWait => "queue_wait",
            Self::Deliver => "deliver"
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage durations found in one message, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayInfo {
    pub family: MtaFamily,
    stages: Vec<(Stage, f64)>,
    /// Postfix `delay=`; reported as-is, never used for the breakdown.
    pub reported_total: Option<f64>
}

impl DelayInfo {
    pub fn parse(
        family: MtaFamily,
        text: &str
    ) -> Self {
        match family {
            MtaFamily::Postfix => parse_postfix(text),
            MtaFamily::Exim => parse_exim(text)
        }
    }

    pub fn get(
        &self,
        stage: Stage
    ) -> Option<f64> {
        self.stages
            .iter()
            .find(|(candidate, _)| *candidate == stage)
            .map(|(_, secs)| *secs)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of the family's stages, `0.0` unless every stage is present.
    pub fn total_seconds(&self) -> f64 {
        let stages = self.family.stages();
        let values: Vec<f64> =
            stages.iter().filter_map(|stage| self.get(*stage)).collect();
        if values.len() == stages.len() { values.iter().sum() } else { 0.0 }
    }
}

fn parse_postfix(text: &str) -> DelayInfo {
    let reported_total = capture_f64(postfix_delay_re(), text, 1);

    let stages = match postfix_delays_re().captures(text) {
        Some(caps) => {
            let values: Vec<f64> = (1..=4)
                .filter_map(|idx| caps.get(idx)?.as_str().parse().ok())
                .collect();
            if values.len() == 4 {
                MtaFamily::Postfix.stages().iter().copied().zip(values).collect()
            } else {
                Vec::new()
            }
        }
        None => Vec::new()
    };

    DelayInfo { family: MtaFamily::Postfix, stages, reported_total }
}

fn parse_exim(text: &str) -> DelayInfo {
    let field = |name: &str| {
        exim_field_re()
            .captures_iter(text)
            .find(|caps| caps.get(1).map(|m| m.as_str()) == Some(name))
            .and_then(|caps| caps.get(2)?.as_str().parse::<f64>().ok())
    };

    let queue_time = field("QT");
    let receive = field("RT");
    let deliver = field("DT");

    let mut stages = Vec::with_capacity(3);
    if let Some(receive) = receive {
        stages.push((Stage::Receive, receive));
    }
    if let Some(queue_time) = queue_time {
        let wait = queue_time - receive.unwrap_or(0.0) - deliver.unwrap_or(0.0);
        stages.push((Stage::QueueWait, wait.max(0.0)));
    }
    if let Some(deliver) = deliver {
        stages.push((Stage::Deliver, deliver));
    }

    DelayInfo { family: MtaFamily::Exim, stages, reported_total: queue_time }
}

fn capture_f64(
    re: &Regex,
    text: &str,
    group: usize
) -> Option<f64> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}

fn postfix_delay_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bdelay=([\d.]+)").expect("delay regex"))
}

fn postfix_delays_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"delays=([\d.]+)/([\d.]+)/([\d.]+)/([\d.]+)")
            .expect("delays regex")
    })
}

fn exim_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(QT|RT|DT)=([\d.]+)s?\b").expect("exim timing regex")
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(service: &str) -> LogEntry {
        LogEntry { service: service.to_string(), ..LogEntry::default() }
    }

    #[test]
    fn postfix_breakdown_in_stage_order() {
        let info = DelayInfo::parse(
            MtaFamily::Postfix,
            "to=<a@b>, relay=x[1.1.1.1]:25, delay=18, delays=1.2/3.4/5.6/7.8, dsn=2.0.0",
        );

        assert_eq!(info.get(Stage::BeforeQmgr), Some(1.2));
        assert_eq!(info.get(Stage::InQmgr), Some(3.4));
        assert_eq!(info.get(Stage::ConnSetup), Some(5.6));
        assert_eq!(info.get(Stage::Transmission), Some(7.8));
        assert!((info.total_seconds() - 18.0).abs() < 1e-9);
        assert_eq!(info.reported_total, Some(18.0));
    }

    #[test]
    fn exim_queue_wait_is_derived() {
        let info = DelayInfo::parse(MtaFamily::Exim, "Completed QT=10s RT=2s DT=3s");

        assert_eq!(info.get(Stage::Receive), Some(2.0));
        assert_eq!(info.get(Stage::QueueWait), Some(5.0));
        assert_eq!(info.get(Stage::Deliver), Some(3.0));
        assert!((info.total_seconds() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn exim_queue_wait_never_goes_negative() {
        let info = DelayInfo::parse(MtaFamily::Exim, "QT=1s RT=2s DT=3s");
        assert_eq!(info.get(Stage::QueueWait), Some(0.0));
    }

    #[test]
    fn unrecognised_text_yields_nothing_and_zero_total() {
        let info = DelayInfo::parse(MtaFamily::Postfix, "connect from unknown");
        assert!(info.is_empty());
        assert_eq!(info.total_seconds(), 0.0);
        assert_eq!(info.reported_total, None);
    }

    #[test]
    fn partial_exim_fields_have_zero_total() {
        let info = DelayInfo::parse(MtaFamily::Exim, "RT=2s");
        assert_eq!(info.get(Stage::Receive), Some(2.0));
        assert_eq!(info.total_seconds(), 0.0);
    }

    #[test]
    fn family_follows_first_named_service() {
        let entries =
            vec![entry("kernel"), entry("exim"), entry("postfix/smtp")];
        assert_eq!(detect_family(&entries), MtaFamily::Exim);
        assert_eq!(detect_family(&[entry("sendmail")]), MtaFamily::Postfix);
    }
}
