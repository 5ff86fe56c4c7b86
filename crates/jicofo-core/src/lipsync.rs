//! Deterministic rewrite of an outgoing source list to merge video into
//! audio per owner (component C6). A pure transformation — no state of its
//! own — over the contents list plus a reference to the target participant.

use std::collections::HashMap;

use crate::source::{MediaSourceMap, MediaType, Owner, Source};

/// Minimal view of a target participant that [`rewrite_for_target`] needs:
/// whether lip-sync is supported and enabled by policy.
pub struct LipSyncTarget {
    pub supports_lip_sync: bool,
}

/// Merge policy: lip-sync only applies when both the feature flag is on and
/// the target supports it (§4.6, §6 `enable-lip-sync`).
pub fn should_merge(enable_lip_sync: bool, target: &LipSyncTarget) -> bool {
    enable_lip_sync && target.supports_lip_sync
}

/// For each owner group in `sources`: if merging applies, rewrite the audio
/// source's `msid` to match the video source's, so a receiver groups them
/// into one logical stream.
pub fn rewrite_for_target(
    sources: &MediaSourceMap,
    enable_lip_sync: bool,
    target: &LipSyncTarget,
) -> MediaSourceMap {
    if !should_merge(enable_lip_sync, target) {
        return sources.clone();
    }

    let video_msid_by_owner: HashMap<String, String> = sources
        .get_sources_for_media(MediaType::Video)
        .iter()
        .filter_map(|s| match (&s.owner, &s.msid) {
            (Owner::Participant(jid), Some(msid)) => Some((jid.clone(), msid.clone())),
            _ => None,
        })
        .collect();

    let mut rewritten = MediaSourceMap::new();
    for media in [MediaType::Audio, MediaType::Video, MediaType::Data] {
        for source in sources.get_sources_for_media(media) {
            let mut merged = source.clone();
            if media == MediaType::Audio {
                if let Owner::Participant(jid) = &source.owner {
                    if let Some(video_msid) = video_msid_by_owner.get(jid) {
                        merged.msid = Some(video_msid.clone());
                    }
                }
            }
            rewritten.add_source(media, merged);
        }
    }
    rewritten
}

/// Synthesizes a matching audio source from conference-wide state when a
/// `source-add` notification contains only video, so the merge can still
/// take place (§4.6 — the `source-add` path extension).
pub fn synthesize_audio_for_video_only_add(
    video_only: &MediaSourceMap,
    conference_audio: &MediaSourceMap,
) -> MediaSourceMap {
    let mut result = video_only.clone();
    if !video_only.get_sources_for_media(MediaType::Audio).is_empty() {
        return result;
    }
    for video in video_only.get_sources_for_media(MediaType::Video) {
        if let Owner::Participant(jid) = &video.owner {
            if let Some(audio) = find_owned_audio(conference_audio, jid) {
                result.add_source(MediaType::Audio, audio.clone());
            }
        }
    }
    result
}

fn find_owned_audio<'a>(map: &'a MediaSourceMap, owner_jid: &str) -> Option<&'a Source> {
    map.get_sources_for_media(MediaType::Audio)
        .iter()
        .find(|s| matches!(&s.owner, Owner::Participant(jid) if jid == owner_jid))
}
