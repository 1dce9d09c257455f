//! Label vocabulary and the pure label state machine.
//!
//! A message carries a set of [`Tag`]s. Folder views are derived from that set
//! rather than stored: [`LabelSet::primary_folder`] picks a single folder by
//! precedence and [`Folder::matches`] decides folder-query membership.

use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{MailError, MailResult};
use crate::models::Message;

/// Custom tags that behave like the inbox: they are stripped when a message is
/// marked as spam and refused while it stays there.
pub const INBOX_LIKE: &[&str] = &["promotions", "social", "updates", "important"];

/// Accepted spellings of the inbox, compared case-insensitively.
const INBOX_ALIASES: &[&str] = &["inbox", "primary"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Inbox,
    Sent,
    Drafts,
    Spam,
    Trash,
    Archive,
    Starred,
    Read,
    Custom(String),
}

impl Tag {
    /// Canonicalizes a raw label name. Only the inbox aliases are matched
    /// case-insensitively; every other name is case-sensitive.
    pub fn parse(raw: &str) -> MailResult<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(MailError::validation("label must be a non-empty string"));
        }

        if INBOX_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(name))
        {
            return Ok(Tag::Inbox);
        }

        let tag = match name {
            "sent" => Tag::Sent,
            "drafts" => Tag::Drafts,
            "spam" => Tag::Spam,
            "trash" => Tag::Trash,
            "archive" => Tag::Archive,
            "starred" => Tag::Starred,
            "read" => Tag::Read,
            other => Tag::Custom(other.to_string()),
        };
        Ok(tag)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Tag::Inbox => "inbox",
            Tag::Sent => "sent",
            Tag::Drafts => "drafts",
            Tag::Spam => "spam",
            Tag::Trash => "trash",
            Tag::Archive => "archive",
            Tag::Starred => "starred",
            Tag::Read => "read",
            Tag::Custom(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, Tag::Custom(_))
    }

    /// Tags that may not coexist with `spam`.
    pub fn is_folder_like(&self) -> bool {
        match self {
            Tag::Inbox | Tag::Drafts | Tag::Sent | Tag::Archive => true,
            Tag::Custom(name) => INBOX_LIKE.contains(&name.as_str()),
            Tag::Spam | Tag::Trash | Tag::Starred | Tag::Read => false,
        }
    }

    /// Tags that place a message somewhere other than the inbox.
    fn is_placement(&self) -> bool {
        matches!(
            self,
            Tag::Sent | Tag::Drafts | Tag::Spam | Tag::Trash | Tag::Archive
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Tag::parse(&raw).map_err(de::Error::custom)
    }
}

/// A derived folder view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Spam,
    Trash,
    Archive,
    Starred,
    Custom(String),
}

impl Folder {
    pub fn parse(raw: &str) -> MailResult<Self> {
        Ok(Self::from_tag(Tag::parse(raw)?))
    }

    pub fn from_tag(tag: Tag) -> Self {
        match tag {
            Tag::Inbox => Folder::Inbox,
            Tag::Sent => Folder::Sent,
            Tag::Drafts => Folder::Drafts,
            Tag::Spam => Folder::Spam,
            Tag::Trash => Folder::Trash,
            Tag::Archive => Folder::Archive,
            Tag::Starred => Folder::Starred,
            Tag::Read => Folder::Custom("read".to_string()),
            Tag::Custom(name) => Folder::Custom(name),
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Folder::Inbox => Tag::Inbox,
            Folder::Sent => Tag::Sent,
            Folder::Drafts => Tag::Drafts,
            Folder::Spam => Tag::Spam,
            Folder::Trash => Tag::Trash,
            Folder::Archive => Tag::Archive,
            Folder::Starred => Tag::Starred,
            Folder::Custom(name) => Tag::Custom(name.clone()),
        }
    }

    /// Folder-query membership of `message` for the mailbox of `caller`.
    pub fn matches(&self, message: &Message, caller: &str) -> bool {
        if message.owner_id != caller {
            return false;
        }

        let labels = &message.labels;
        match self {
            Folder::Inbox => {
                labels.contains(&Tag::Inbox)
                    && !labels.contains(&Tag::Spam)
                    && !labels.contains(&Tag::Trash)
                    && !labels.contains(&Tag::Archive)
            }
            Folder::Spam => labels.contains(&Tag::Spam) && message.recipient_id == caller,
            Folder::Sent => {
                labels.contains(&Tag::Sent)
                    && message.sender_id == caller
                    && !labels.contains(&Tag::Trash)
            }
            Folder::Drafts => labels.contains(&Tag::Drafts) && message.sender_id == caller,
            Folder::Trash => labels.contains(&Tag::Trash),
            Folder::Archive | Folder::Starred | Folder::Custom(_) => {
                labels.contains(&self.tag()) && !labels.contains(&Tag::Trash)
            }
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().as_str())
    }
}

/// The label set of one mailbox-scoped message copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    tags: HashSet<Tag>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }

    pub fn parse_all<I, S>(names: I) -> MailResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for name in names {
            set.tags.insert(Tag::parse(name.as_ref())?);
        }
        Ok(set)
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_spam(&self) -> bool {
        self.contains(&Tag::Spam)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    /// Sorted canonical names, for storage and display.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tags.iter().map(|t| t.as_str().to_string()).collect();
        names.sort();
        names
    }

    /// Raw insertion without transition rules. Used when building sets from
    /// trusted storage.
    pub fn insert(&mut self, tag: Tag) -> bool {
        self.tags.insert(tag)
    }

    /// Adds `tag` under the transition rules. Returns whether the set changed.
    ///
    /// Adding `spam` strips every folder-like tag; adding a folder-like tag to
    /// a spam message is a conflict.
    pub fn add(&mut self, tag: Tag) -> MailResult<bool> {
        if tag == Tag::Spam {
            let already = self.is_spam();
            self.mark_spam();
            return Ok(!already);
        }

        if tag.is_folder_like() && self.is_spam() {
            return Err(MailError::Conflict(format!(
                "message is marked as spam; unmark it before adding `{tag}`"
            )));
        }

        Ok(self.tags.insert(tag))
    }

    /// Removes `tag` if present. Idempotent.
    pub fn remove(&mut self, tag: &Tag) -> bool {
        self.tags.remove(tag)
    }

    /// Marks the set as spam, returning the folder-like tags that were dropped.
    /// `starred`, `read`, `trash` and plain custom tags survive.
    pub fn mark_spam(&mut self) -> Vec<Tag> {
        let mut dropped: Vec<Tag> = self
            .tags
            .iter()
            .filter(|t| t.is_folder_like())
            .cloned()
            .collect();
        dropped.sort();
        for tag in &dropped {
            self.tags.remove(tag);
        }
        self.tags.insert(Tag::Spam);
        dropped
    }

    pub fn unmark_spam(&mut self) -> bool {
        self.tags.remove(&Tag::Spam)
    }

    /// Archive and inbox are mutually exclusive. Returns whether the message is
    /// archived afterwards.
    pub fn toggle_archive(&mut self) -> MailResult<bool> {
        if self.tags.remove(&Tag::Archive) {
            self.restore_inbox();
            return Ok(false);
        }

        if self.is_spam() {
            return Err(MailError::Conflict(
                "message is marked as spam; unmark it before archiving".to_string(),
            ));
        }

        self.tags.remove(&Tag::Inbox);
        self.tags.insert(Tag::Archive);
        Ok(true)
    }

    /// Trash and inbox are mutually exclusive. Returns whether the message is
    /// trashed afterwards.
    pub fn toggle_trash(&mut self) -> bool {
        if self.tags.remove(&Tag::Trash) {
            self.restore_inbox();
            return false;
        }

        self.tags.remove(&Tag::Inbox);
        self.tags.insert(Tag::Trash);
        true
    }

    // Re-adds the inbox only when nothing else places the message.
    fn restore_inbox(&mut self) {
        if !self.tags.iter().any(Tag::is_placement) {
            self.tags.insert(Tag::Inbox);
        }
    }

    /// Single folder reported for folder-scoped views.
    /// Precedence: trash > spam > drafts > sent > archive > inbox > custom.
    pub fn primary_folder(&self) -> Option<Folder> {
        const ORDER: [Tag; 6] = [
            Tag::Trash,
            Tag::Spam,
            Tag::Drafts,
            Tag::Sent,
            Tag::Archive,
            Tag::Inbox,
        ];

        if let Some(tag) = ORDER.iter().find(|tag| self.contains(tag)) {
            return Some(Folder::from_tag(tag.clone()));
        }

        self.tags
            .iter()
            .filter_map(|tag| match tag {
                Tag::Custom(name) => Some(name),
                _ => None,
            })
            .min()
            .map(|name| Folder::Custom(name.clone()))
    }
}

impl FromIterator<Tag> for LabelSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self::of(iter)
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in &names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LabelSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        LabelSet::parse_all(names).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> LabelSet {
        LabelSet::parse_all(names).expect("valid names")
    }

    #[test]
    fn inbox_aliases_are_canonicalized() {
        for raw in ["inbox", "INBOX", "Inbox", " primary ", "PRIMARY"] {
            assert_eq!(Tag::parse(raw).unwrap(), Tag::Inbox, "{raw}");
        }
        assert_eq!(Tag::parse("INBOX").unwrap().as_str(), "inbox");
    }

    #[test]
    fn other_names_are_case_sensitive() {
        assert_eq!(Tag::parse("spam").unwrap(), Tag::Spam);
        assert_eq!(Tag::parse("Spam").unwrap(), Tag::Custom("Spam".to_string()));
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(matches!(Tag::parse("   "), Err(MailError::Validation(_))));
    }

    #[test]
    fn add_then_remove_restores_the_set() {
        let original = set(&["inbox", "starred", "work"]);
        for name in ["archive", "trash", "drafts", "sent", "read", "travel", "social"] {
            let mut labels = original.clone();
            let tag = Tag::parse(name).unwrap();
            assert!(labels.add(tag.clone()).unwrap());
            assert!(labels.remove(&tag));
            assert_eq!(labels, original, "round trip through {name}");
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut labels = set(&["inbox"]);
        assert!(labels.add(Tag::Custom("work".into())).unwrap());
        assert!(!labels.add(Tag::Custom("work".into())).unwrap());
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn marking_spam_strips_folder_tags_but_keeps_star() {
        let mut labels = set(&["inbox", "starred", "promotions", "work"]);
        let dropped = labels.mark_spam();
        assert_eq!(dropped, vec![Tag::Inbox, Tag::Custom("promotions".into())]);
        assert_eq!(labels, set(&["spam", "starred", "work"]));
    }

    #[test]
    fn folder_tags_are_refused_on_spam() {
        let mut labels = set(&["spam"]);
        assert!(matches!(labels.add(Tag::Inbox), Err(MailError::Conflict(_))));
        assert!(matches!(
            labels.add(Tag::Custom("updates".into())),
            Err(MailError::Conflict(_))
        ));
        assert!(labels.add(Tag::Starred).unwrap());
        assert_eq!(labels, set(&["spam", "starred"]));
    }

    #[test]
    fn archive_round_trip_never_keeps_inbox() {
        let original = set(&["inbox", "starred"]);
        let mut labels = original.clone();

        assert!(labels.toggle_archive().unwrap());
        assert!(labels.contains(&Tag::Archive));
        assert!(!labels.contains(&Tag::Inbox));

        assert!(!labels.toggle_archive().unwrap());
        assert_eq!(labels, original);
    }

    #[test]
    fn trash_round_trip_never_keeps_inbox() {
        let original = set(&["inbox", "work"]);
        let mut labels = original.clone();

        assert!(labels.toggle_trash());
        assert!(!labels.contains(&Tag::Inbox));
        assert!(!labels.toggle_trash());
        assert_eq!(labels, original);
    }

    #[test]
    fn untrash_keeps_other_placements() {
        for names in [&["sent"][..], &["archive"], &["spam", "starred"]] {
            let original = set(names);
            let mut labels = original.clone();
            labels.toggle_trash();
            labels.toggle_trash();
            assert_eq!(labels, original, "{names:?}");
        }
    }

    #[test]
    fn archiving_spam_is_a_conflict() {
        let mut labels = set(&["spam"]);
        assert!(matches!(labels.toggle_archive(), Err(MailError::Conflict(_))));
        assert_eq!(labels, set(&["spam"]));
    }

    #[test]
    fn primary_folder_follows_precedence() {
        assert_eq!(set(&["inbox", "trash", "spam"]).primary_folder(), Some(Folder::Trash));
        assert_eq!(set(&["spam", "starred"]).primary_folder(), Some(Folder::Spam));
        assert_eq!(set(&["sent", "drafts"]).primary_folder(), Some(Folder::Drafts));
        assert_eq!(set(&["archive", "sent"]).primary_folder(), Some(Folder::Sent));
        assert_eq!(set(&["archive", "inbox"]).primary_folder(), Some(Folder::Archive));
        assert_eq!(set(&["work", "inbox"]).primary_folder(), Some(Folder::Inbox));
        assert_eq!(
            set(&["zeta", "alpha", "starred"]).primary_folder(),
            Some(Folder::Custom("alpha".into()))
        );
        assert_eq!(set(&["starred", "read"]).primary_folder(), None);
    }

    #[test]
    fn serializes_as_sorted_names() {
        let labels = set(&["starred", "INBOX", "work"]);
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"["inbox","starred","work"]"#);

        let back: LabelSet = serde_json::from_str(r#"["Primary","spam"]"#).unwrap();
        assert_eq!(back, set(&["inbox", "spam"]));
    }
}
