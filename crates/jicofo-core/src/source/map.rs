//! Typed containers for RTP sources and source-groups (component C1).

use std::collections::HashMap;
use std::fmt;

/// Media kind carried by a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaType {
    Audio,
    Video,
    Data,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
            MediaType::Data => write!(f, "data"),
        }
    }
}

/// Semantics tag for a [`SourceGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupSemantics {
    Sim,
    Fid,
    FecFr,
}

impl fmt::Display for GroupSemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupSemantics::Sim => write!(f, "SIM"),
            GroupSemantics::Fid => write!(f, "FID"),
            GroupSemantics::FecFr => write!(f, "FEC-FR"),
        }
    }
}

/// Owner of a source: a participant JID, or the relay itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Participant(String),
    Jvb,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Participant(jid) => write!(f, "{jid}"),
            Owner::Jvb => write!(f, "jvb"),
        }
    }
}

/// An RTP stream identifier.
///
/// Equality for dedup purposes is by `ssrc` when present, else by `rid`
/// (§4.1): two sources with different `ssrc` but the same `rid` are
/// considered distinct identities only when both lack an `ssrc`.
#[derive(Debug, Clone)]
pub struct Source {
    pub ssrc: Option<u32>,
    pub rid: Option<String>,
    pub media_type: MediaType,
    pub cname: Option<String>,
    pub msid: Option<String>,
    pub owner: Owner,
}

impl Source {
    pub fn new(media_type: MediaType, owner: Owner) -> Self {
        Self {
            ssrc: None,
            rid: None,
            media_type,
            cname: None,
            msid: None,
            owner,
        }
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    pub fn with_msid(mut self, msid: impl Into<String>) -> Self {
        self.msid = Some(msid.into());
        self
    }

    /// Identity key used for dedup: `ssrc` when present, else `rid`.
    fn identity_key(&self) -> SourceKey {
        match self.ssrc {
            Some(ssrc) => SourceKey::Ssrc(ssrc),
            None => SourceKey::Rid(self.rid.clone().unwrap_or_default()),
        }
    }

    pub fn identity_eq(&self, other: &Source) -> bool {
        self.identity_key() == other.identity_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SourceKey {
    Ssrc(u32),
    Rid(String),
}

/// A semantics tag plus an ordered list of member sources.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub semantics: GroupSemantics,
    pub sources: Vec<Source>,
}

impl SourceGroup {
    pub fn new(semantics: GroupSemantics, sources: Vec<Source>) -> Self {
        Self { semantics, sources }
    }

    /// The group's `msid`, defined as the common `msid` of its members.
    /// Returns `None` if members disagree (an invalid group, per §4.2 rule 1).
    pub fn msid(&self) -> Option<&str> {
        let mut iter = self.sources.iter().filter_map(|s| s.msid.as_deref());
        let first = iter.next()?;
        if iter.all(|m| m == first) {
            Some(first)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Whether this group is signalled via `rid` rather than `ssrc`.
    pub fn is_rid_based(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|s| s.ssrc.is_none())
    }

    fn same_members(&self, other: &SourceGroup) -> bool {
        self.semantics == other.semantics
            && self.sources.len() == other.sources.len()
            && self
                .sources
                .iter()
                .zip(other.sources.iter())
                .all(|(a, b)| a.identity_eq(b))
    }
}

/// `media-kind -> ordered list of Source`, insertion order preserved for
/// reproducibility of offers (§4.1).
#[derive(Debug, Clone, Default)]
pub struct MediaSourceMap {
    by_media: HashMap<MediaType, Vec<Source>>,
}

impl MediaSourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_media.values().all(|v| v.is_empty())
    }

    pub fn get_sources_for_media(&self, media: MediaType) -> &[Source] {
        self.by_media.get(&media).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn media_kinds(&self) -> impl Iterator<Item = MediaType> + '_ {
        self.by_media
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(m, _)| *m)
    }

    /// Adds a single source under its media kind, skipping if its identity
    /// already exists for that media kind.
    pub fn add_source(&mut self, media: MediaType, source: Source) {
        let bucket = self.by_media.entry(media).or_default();
        if !bucket.iter().any(|existing| existing.identity_eq(&source)) {
            bucket.push(source);
        }
    }

    /// Merges another map into this one, skipping sources whose identity
    /// already exists under that media kind.
    pub fn add(&mut self, other: &MediaSourceMap) {
        for media in other.by_media.keys() {
            for source in other.get_sources_for_media(*media) {
                self.add_source(*media, source.clone());
            }
        }
    }

    /// Removes the sources in `other` from `self`, returning exactly the
    /// subset that was present and actually removed (§4.1).
    pub fn remove(&mut self, other: &MediaSourceMap) -> MediaSourceMap {
        let mut removed = MediaSourceMap::new();
        for media in other.by_media.keys() {
            let Some(bucket) = self.by_media.get_mut(media) else {
                continue;
            };
            for candidate in other.get_sources_for_media(*media) {
                if let Some(pos) = bucket.iter().position(|s| s.identity_eq(candidate)) {
                    let removed_source = bucket.remove(pos);
                    removed.add_source(*media, removed_source);
                }
            }
        }
        removed
    }

    pub fn find_sources_with_msid(&self, media: MediaType, msid: &str) -> Vec<&Source> {
        self.get_sources_for_media(media)
            .iter()
            .filter(|s| s.msid.as_deref() == Some(msid))
            .collect()
    }

    pub fn find_ssrc_for_owner(&self, media: MediaType, owner: &Owner) -> Option<u32> {
        self.get_sources_for_media(media)
            .iter()
            .find(|s| &s.owner == owner)
            .and_then(|s| s.ssrc)
    }

    pub fn get_media_type_for_source(&self, source: &Source) -> Option<MediaType> {
        self.by_media
            .iter()
            .find(|(_, bucket)| bucket.iter().any(|s| s.identity_eq(source)))
            .map(|(media, _)| *media)
    }

    /// Full independent clone: mutating the clone never affects `self`.
    pub fn copy_deep(&self) -> MediaSourceMap {
        self.clone()
    }
}

/// `media-kind -> ordered list of SourceGroup`, with the same operations as
/// [`MediaSourceMap`].
#[derive(Debug, Clone, Default)]
pub struct MediaSourceGroupMap {
    by_media: HashMap<MediaType, Vec<SourceGroup>>,
}

impl MediaSourceGroupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_media.values().all(|v| v.is_empty())
    }

    pub fn get_groups_for_media(&self, media: MediaType) -> &[SourceGroup] {
        self.by_media.get(&media).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn media_kinds(&self) -> impl Iterator<Item = MediaType> + '_ {
        self.by_media
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(m, _)| *m)
    }

    /// Adds a group, skipping if an identical group (semantics + member set)
    /// is already present (§4.2 accept-time rule).
    pub fn add_group(&mut self, media: MediaType, group: SourceGroup) {
        let bucket = self.by_media.entry(media).or_default();
        if !bucket.iter().any(|existing| existing.same_members(&group)) {
            bucket.push(group);
        }
    }

    pub fn add(&mut self, other: &MediaSourceGroupMap) {
        for media in other.by_media.keys() {
            for group in other.get_groups_for_media(*media) {
                self.add_group(*media, group.clone());
            }
        }
    }

    pub fn remove(&mut self, other: &MediaSourceGroupMap) -> MediaSourceGroupMap {
        let mut removed = MediaSourceGroupMap::new();
        for media in other.by_media.keys() {
            let Some(bucket) = self.by_media.get_mut(media) else {
                continue;
            };
            for candidate in other.get_groups_for_media(*media) {
                if let Some(pos) = bucket.iter().position(|g| g.same_members(candidate)) {
                    let removed_group = bucket.remove(pos);
                    removed.add_group(*media, removed_group);
                }
            }
        }
        removed
    }

    pub fn copy_deep(&self) -> MediaSourceGroupMap {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_source(ssrc: u32, owner: &str) -> Source {
        Source::new(MediaType::Audio, Owner::Participant(owner.to_string())).with_ssrc(ssrc)
    }

    #[test]
    fn add_then_remove_round_trips() {
        let mut map = MediaSourceMap::new();
        let s = audio_source(1001, "p1@room").with_msid("s1").with_cname("c1");
        map.add_source(MediaType::Audio, s.clone());

        let mut to_remove = MediaSourceMap::new();
        to_remove.add_source(MediaType::Audio, s);
        let removed = map.remove(&to_remove);

        assert!(map.is_empty());
        assert_eq!(removed.get_sources_for_media(MediaType::Audio).len(), 1);
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut map = MediaSourceMap::new();
        map.add_source(MediaType::Audio, audio_source(1, "p1@room"));

        let mut copy = map.copy_deep();
        copy.add_source(MediaType::Audio, audio_source(2, "p1@room"));

        assert_eq!(map.get_sources_for_media(MediaType::Audio).len(), 1);
        assert_eq!(copy.get_sources_for_media(MediaType::Audio).len(), 2);
    }

    #[test]
    fn duplicate_ssrc_is_not_re_added() {
        let mut map = MediaSourceMap::new();
        map.add_source(MediaType::Audio, audio_source(1, "p1@room"));
        map.add_source(MediaType::Audio, audio_source(1, "p1@room"));
        assert_eq!(map.get_sources_for_media(MediaType::Audio).len(), 1);
    }

    #[test]
    fn remove_returns_only_the_effective_delta() {
        let mut map = MediaSourceMap::new();
        map.add_source(MediaType::Audio, audio_source(1, "p1@room"));

        let mut to_remove = MediaSourceMap::new();
        to_remove.add_source(MediaType::Audio, audio_source(1, "p1@room"));
        to_remove.add_source(MediaType::Audio, audio_source(2, "p1@room"));

        let removed = map.remove(&to_remove);
        assert_eq!(removed.get_sources_for_media(MediaType::Audio).len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn group_msid_requires_member_agreement() {
        let a = audio_source(1, "p1@room").with_msid("s1");
        let b = audio_source(2, "p1@room").with_msid("s1");
        let group = SourceGroup::new(GroupSemantics::Fid, vec![a, b]);
        assert_eq!(group.msid(), Some("s1"));

        let c = audio_source(3, "p1@room").with_msid("s2");
        let mismatched = SourceGroup::new(GroupSemantics::Fid, vec![group.sources[0].clone(), c]);
        assert_eq!(mismatched.msid(), None);
    }
}
