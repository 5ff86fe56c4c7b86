//! One-shot validator applied to each incoming source change (component C2).

use std::collections::{HashMap, HashSet};

use crate::error::{JicofoError, Result};
use crate::source::map::{
    GroupSemantics, MediaSourceGroupMap, MediaSourceMap, MediaType, Source, SourceGroup,
};

/// Validates one hypothetical source/group change against the current
/// conference-wide state. One instance is constructed per change attempt.
pub struct SourceValidator<'a> {
    /// Sources already present in the conference, across all participants.
    conference_sources: &'a MediaSourceMap,
    conference_groups: &'a MediaSourceGroupMap,
    endpoint_id: &'a str,
    max_sources_per_media: usize,
}

impl<'a> SourceValidator<'a> {
    pub fn new(
        conference_sources: &'a MediaSourceMap,
        conference_groups: &'a MediaSourceGroupMap,
        endpoint_id: &'a str,
        max_sources_per_media: usize,
    ) -> Self {
        Self {
            conference_sources,
            conference_groups,
            endpoint_id,
            max_sources_per_media,
        }
    }

    /// Accepts as much of `new_sources`/`new_groups` as the invariants allow,
    /// then validates the hypothetical post-state. On violation the whole
    /// change is rejected atomically (§4.2).
    pub fn try_add(
        &self,
        new_sources: &MediaSourceMap,
        new_groups: &MediaSourceGroupMap,
    ) -> Result<(MediaSourceMap, MediaSourceGroupMap)> {
        let mut accepted_sources = MediaSourceMap::new();
        let mut per_media_count: HashMap<MediaType, usize> = HashMap::new();

        for media in new_sources.media_kinds() {
            let cap = self.max_sources_per_media;
            for source in new_sources.get_sources_for_media(media) {
                if source.ssrc.is_none() && source.rid.is_none() {
                    return Err(JicofoError::invalid_sources(
                        "source must carry an ssrc or a rid",
                    ));
                }
                if let Some(ssrc) = source.ssrc {
                    if ssrc == 0 {
                        return Err(JicofoError::invalid_sources("ssrc must be non-zero"));
                    }
                }
                if self.exists_in_any_media(source) {
                    return Err(JicofoError::invalid_sources(format!(
                        "ssrc/rid already present in conference for {}",
                        self.endpoint_id
                    )));
                }

                let count = per_media_count.entry(media).or_insert(0);
                if *count >= cap {
                    tracing::warn!(
                        endpoint = self.endpoint_id,
                        media = %media,
                        "dropping source past per-owner cap of {cap}"
                    );
                    continue;
                }
                *count += 1;

                let mut stripped = source.clone();
                let cname = stripped.cname.take();
                let msid = stripped.msid.take();
                stripped.cname = cname;
                stripped.msid = msid;
                accepted_sources.add_source(media, stripped);
            }
        }

        let mut accepted_groups = MediaSourceGroupMap::new();
        for media in new_groups.media_kinds() {
            for group in new_groups.get_groups_for_media(media) {
                if group.is_empty() {
                    tracing::warn!("dropping empty source group");
                    continue;
                }
                accepted_groups.add_group(media, group.clone());
            }
        }

        let mut hypothetical_sources = self.conference_sources.clone();
        hypothetical_sources.add(&accepted_sources);
        let mut hypothetical_groups = self.conference_groups.clone();
        hypothetical_groups.add(&accepted_groups);

        validate(&hypothetical_sources, &hypothetical_groups)?;

        Ok((accepted_sources, accepted_groups))
    }

    /// Removes `sources_to_remove`/`groups_to_remove`, then validates the
    /// hypothetical post-state (removal can never re-introduce a conflict,
    /// but is still run through `validate` for uniformity, per §4.2).
    pub fn try_remove(
        &self,
        sources_to_remove: &MediaSourceMap,
        groups_to_remove: &MediaSourceGroupMap,
    ) -> Result<(MediaSourceMap, MediaSourceGroupMap)> {
        let mut hypothetical_sources = self.conference_sources.clone();
        let removed_sources = hypothetical_sources.remove(sources_to_remove);
        let mut hypothetical_groups = self.conference_groups.clone();
        let removed_groups = hypothetical_groups.remove(groups_to_remove);

        validate(&hypothetical_sources, &hypothetical_groups)?;

        Ok((removed_sources, removed_groups))
    }

    fn exists_in_any_media(&self, source: &Source) -> bool {
        for media in [MediaType::Audio, MediaType::Video, MediaType::Data] {
            if self
                .conference_sources
                .get_sources_for_media(media)
                .iter()
                .any(|existing| existing.identity_eq(source))
            {
                return true;
            }
        }
        false
    }
}

/// A computed view combining one SIM group with any per-layer FID groups
/// whose first SSRC is a SIM member (§3 `SimulcastGrouping`).
struct SimulcastGrouping<'a> {
    sim: &'a SourceGroup,
    fids: Vec<&'a SourceGroup>,
}

impl<'a> SimulcastGrouping<'a> {
    fn member_ssrcs(&self) -> HashSet<u32> {
        let mut set: HashSet<u32> = self.sim.sources.iter().filter_map(|s| s.ssrc).collect();
        for fid in &self.fids {
            set.extend(fid.sources.iter().filter_map(|s| s.ssrc));
        }
        set
    }
}

fn build_simulcast_groupings<'a>(groups: &'a [SourceGroup]) -> Vec<SimulcastGrouping<'a>> {
    groups
        .iter()
        .filter(|g| g.semantics == GroupSemantics::Sim)
        .map(|sim| {
            let sim_first_ssrcs: HashSet<u32> =
                sim.sources.iter().filter_map(|s| s.ssrc).collect();
            let fids = groups
                .iter()
                .filter(|g| {
                    g.semantics == GroupSemantics::Fid
                        && g.sources
                            .first()
                            .and_then(|s| s.ssrc)
                            .is_some_and(|ssrc| sim_first_ssrcs.contains(&ssrc))
                })
                .collect();
            SimulcastGrouping { sim, fids }
        })
        .collect()
}

/// Final validation run on the hypothetical post-state, always (§4.2).
///
/// Order of checks is stable and each violation has distinct error text so
/// tests can match by substring (§4.2).
fn validate(sources: &MediaSourceMap, groups: &MediaSourceGroupMap) -> Result<()> {
    for media in [MediaType::Audio, MediaType::Video, MediaType::Data] {
        let media_groups = groups.get_groups_for_media(media);
        let media_sources = sources.get_sources_for_media(media);

        // Rule 1: migrate attributes, every grouped ssrc-bearing source has
        // a non-empty msid, and all members of one group share it.
        for group in media_groups {
            let has_ssrc_member = group.sources.iter().any(|s| s.ssrc.is_some());
            if !has_ssrc_member {
                continue;
            }
            for member in &group.sources {
                if member.ssrc.is_some() && member.msid.as_deref().unwrap_or("").is_empty() {
                    return Err(JicofoError::invalid_sources(
                        "MSID missing on a grouped ssrc-bearing source",
                    ));
                }
            }
            if group.msid().is_none() {
                return Err(JicofoError::invalid_sources(
                    "MSID mismatch among members of one source group",
                ));
            }
        }

        // Rule 2: a SIM grouping's msid must not appear on any ssrc outside it.
        let simulcast_groupings = build_simulcast_groupings(media_groups);
        for grouping in &simulcast_groupings {
            if grouping.sim.is_rid_based() {
                continue;
            }
            let Some(msid) = grouping.sim.msid() else {
                continue;
            };
            let member_ssrcs = grouping.member_ssrcs();
            for source in media_sources {
                let Some(ssrc) = source.ssrc else { continue };
                if member_ssrcs.contains(&ssrc) {
                    continue;
                }
                if source.msid.as_deref() == Some(msid) {
                    return Err(JicofoError::invalid_sources(format!(
                        "MSID {msid} of a SIM grouping also used outside it"
                    )));
                }
            }
        }

        // Rule 3: FID groups outside any SIM grouping must have pairwise
        // distinct msids.
        let sim_member_ssrcs: HashSet<u32> = simulcast_groupings
            .iter()
            .flat_map(|g| g.member_ssrcs())
            .collect();
        let standalone_fid_msids: Vec<&str> = media_groups
            .iter()
            .filter(|g| g.semantics == GroupSemantics::Fid)
            .filter(|g| {
                !g.sources
                    .iter()
                    .filter_map(|s| s.ssrc)
                    .any(|ssrc| sim_member_ssrcs.contains(&ssrc))
            })
            .filter_map(|g| g.msid())
            .collect();
        let mut seen = HashSet::new();
        for msid in &standalone_fid_msids {
            if !seen.insert(*msid) {
                return Err(JicofoError::invalid_sources(format!(
                    "MSID {msid} shared by two independent FID groups"
                )));
            }
        }

        // Rule 4: among ungrouped sources per media kind, no two share an msid.
        let grouped_ssrcs: HashSet<u32> = media_groups
            .iter()
            .flat_map(|g| g.sources.iter().filter_map(|s| s.ssrc))
            .collect();
        let mut seen_ungrouped = HashSet::new();
        for source in media_sources {
            if let Some(ssrc) = source.ssrc {
                if grouped_ssrcs.contains(&ssrc) {
                    continue;
                }
            }
            let Some(msid) = source.msid.as_deref() else {
                continue;
            };
            if !seen_ungrouped.insert(msid) {
                return Err(JicofoError::invalid_sources(format!(
                    "MSID {msid} shared by two ungrouped sources"
                )));
            }
        }
    }

    Ok(())
}
