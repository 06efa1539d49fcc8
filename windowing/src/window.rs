//! Window snapshots and the records built from them
//!
//! A [`WindowSnapshot`] is the coordinator's copy of `seq_len` ring slots in
//! logical frame order. Worker tasks turn it into a [`WindowRecord`]:
//!
//! - the visual slice (frames and flow fields),
//! - a per-individual track table padded with [`ABSENT`] where an id is missing,
//! - an interaction graph with spatial edges (same frame) and temporal edges
//!   (same individual across its successive appearances).
//!
//! Records are serialized into a [`Payload`] of named byte entries, which is
//! what the shard writer stores.

use crate::error::{Result, WindowingError};
use crate::types::{
    BoundingBox, DetectionSet, FlowField, Frame, Keypoints, ABSENT, NUM_KEYPOINTS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Record key for the window of `video_id` ending at frame `window_end`
pub fn window_key(video_id: &str, window_end: usize) -> String {
    format!("{}_{}", video_id, window_end)
}

/// Ring contents for one window, copied out under the pipeline lock
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub video_id: String,
    /// Exclusive end frame `n`; the window covers `[n - seq_len, n)`
    pub window_end: usize,
    pub frames: Vec<Frame>,
    pub flows: Vec<FlowField>,
    pub detections: Vec<DetectionSet>,
}

impl WindowSnapshot {
    pub fn key(&self) -> String {
        window_key(&self.video_id, self.window_end)
    }

    pub fn seq_len(&self) -> usize {
        self.frames.len()
    }

    pub fn window_start(&self) -> usize {
        self.window_end.saturating_sub(self.seq_len())
    }

    /// Distinct individual ids appearing anywhere in the window, ascending
    pub fn individual_ids(&self) -> Vec<u32> {
        self.detections
            .iter()
            .flat_map(|set| set.detections.iter().map(|d| d.individual_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Check that all three slices cover exactly `[start, end)` in order
    pub fn validate(&self) -> Result<()> {
        let key = self.key();
        let seq_len = self.seq_len();
        if seq_len == 0 || self.window_end < seq_len {
            return Err(WindowingError::window(key, "empty or truncated window"));
        }
        if self.flows.len() != seq_len || self.detections.len() != seq_len {
            return Err(WindowingError::window(
                key,
                format!(
                    "slice lengths differ: {} frames, {} flows, {} detection sets",
                    seq_len,
                    self.flows.len(),
                    self.detections.len()
                ),
            ));
        }
        let start = self.window_start();
        for t in 0..seq_len {
            let expected = start + t;
            let got = (
                self.frames[t].index,
                self.flows[t].index,
                self.detections[t].frame_index,
            );
            if got != (expected, expected, expected) {
                return Err(WindowingError::window(
                    key,
                    format!(
                        "slot {} holds frame/flow/detections {:?}, expected frame {}",
                        t, got, expected
                    ),
                ));
            }
            if let Some(id) = self.detections[t].duplicate_id() {
                return Err(WindowingError::window(
                    key,
                    format!("individual {} appears twice in frame {}", id, expected),
                ));
            }
        }
        let shape = self.frames[0].pixels().shape().to_vec();
        if self.frames.iter().any(|f| f.pixels().shape() != shape.as_slice()) {
            return Err(WindowingError::window(key, "frame sizes differ within window"));
        }
        let (h, w) = (self.frames[0].height(), self.frames[0].width());
        if self.flows.iter().any(|f| f.height() != h || f.width() != w) {
            return Err(WindowingError::window(key, "flow fields do not match frame size"));
        }
        Ok(())
    }
}

/// Track of one individual across all frames of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualTrack {
    pub individual_id: u32,
    pub bboxes: Vec<[f32; 4]>,
    pub keypoints: Vec<Keypoints>,
    /// `false` where the individual was not detected; those entries hold [`ABSENT`]
    pub present: Vec<bool>,
}

impl IndividualTrack {
    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn present_count(&self) -> usize {
        self.present.iter().filter(|p| **p).count()
    }
}

/// Per-individual tracks for every id seen in the window, ordered by id
pub fn build_tracks(detections: &[DetectionSet]) -> Vec<IndividualTrack> {
    let seq_len = detections.len();
    let ids: BTreeSet<u32> = detections
        .iter()
        .flat_map(|set| set.detections.iter().map(|d| d.individual_id))
        .collect();

    ids.into_iter()
        .map(|id| {
            let mut track = IndividualTrack {
                individual_id: id,
                bboxes: vec![[ABSENT; 4]; seq_len],
                keypoints: vec![[[ABSENT; 2]; NUM_KEYPOINTS]; seq_len],
                present: vec![false; seq_len],
            };
            for (t, set) in detections.iter().enumerate() {
                if let Some(det) = set.get(id) {
                    track.bboxes[t] = det.bbox.to_array();
                    track.keypoints[t] = det.keypoints;
                    track.present[t] = true;
                }
            }
            track
        })
        .collect()
}

/// One detection in the interaction graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Position within the window, `0..seq_len`
    pub t: usize,
    pub individual_id: u32,
    pub bbox: [f32; 4],
    pub keypoints: Keypoints,
}

impl GraphNode {
    pub fn center(&self) -> (f32, f32) {
        let [x1, y1, x2, y2] = self.bbox;
        BoundingBox::new(x1, y1, x2, y2).center()
    }
}

/// Directed spatial and temporal edges over the detections of a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionGraph {
    pub nodes: Vec<GraphNode>,
    pub spatial_edges: Vec<[usize; 2]>,
    /// `|center_i - center_j|` per axis
    pub spatial_attrs: Vec<[f32; 2]>,
    pub temporal_edges: Vec<[usize; 2]>,
    /// `|center_i - center_j| / |t_i - t_j|` per axis
    pub temporal_attrs: Vec<[f32; 2]>,
}

impl InteractionGraph {
    pub fn build(detections: &[DetectionSet]) -> Self {
        let mut graph = Self::default();
        let mut last_seen: BTreeMap<u32, usize> = BTreeMap::new();

        for (t, set) in detections.iter().enumerate() {
            let first = graph.nodes.len();
            for det in &set.detections {
                graph.nodes.push(GraphNode {
                    t,
                    individual_id: det.individual_id,
                    bbox: det.bbox.to_array(),
                    keypoints: det.keypoints,
                });
            }
            let frame_nodes = first..graph.nodes.len();

            // every ordered pair within the frame
            for i in frame_nodes.clone() {
                for j in frame_nodes.clone() {
                    if i != j {
                        let attr = graph.offset(i, j, 1.0);
                        graph.spatial_edges.push([i, j]);
                        graph.spatial_attrs.push(attr);
                    }
                }
            }

            for cur in frame_nodes {
                let id = graph.nodes[cur].individual_id;
                if let Some(prev) = last_seen.insert(id, cur) {
                    let gap = graph.nodes[cur].t - graph.nodes[prev].t;
                    if gap == 0 {
                        continue;
                    }
                    let gap = gap as f32;
                    let attr = graph.offset(prev, cur, gap);
                    graph.temporal_edges.push([prev, cur]);
                    graph.temporal_attrs.push(attr);
                    graph.temporal_edges.push([cur, prev]);
                    graph.temporal_attrs.push(attr);
                }
            }
        }
        graph
    }

    fn offset(&self, i: usize, j: usize, scale: f32) -> [f32; 2] {
        let (xi, yi) = self.nodes[i].center();
        let (xj, yj) = self.nodes[j].center();
        [(xi - xj).abs() / scale, (yi - yj).abs() / scale]
    }

    /// Spatial edges whose endpoints sit at window position `t`
    pub fn spatial_edges_at(&self, t: usize) -> usize {
        self.spatial_edges
            .iter()
            .filter(|[i, _]| self.nodes[*i].t == t)
            .count()
    }
}

/// Descriptive header stored with every record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub key: String,
    pub video_id: String,
    pub window_start: usize,
    pub window_end: usize,
    pub seq_len: usize,
    /// `[seq_len, height, width, 3]`
    pub frame_shape: [usize; 4],
    /// `[seq_len, height, width, 2]`
    pub flow_shape: [usize; 4],
    pub individual_ids: Vec<u32>,
}

/// Serialized form of one window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRecord {
    pub meta: WindowMeta,
    /// Raw RGB bytes, `seq_len x H x W x 3`
    pub frames: Vec<u8>,
    /// Flow vectors, `seq_len x H x W x 2`
    pub flow: Vec<f32>,
    pub individuals: Vec<IndividualTrack>,
    pub graph: InteractionGraph,
}

/// Named entries of one record as stored in a shard, e.g. `("graph.json", bytes)`
pub type Payload = Vec<(String, Vec<u8>)>;

pub const META_ENTRY: &str = "meta.json";
pub const FRAMES_ENTRY: &str = "frames.u8";
pub const FLOW_ENTRY: &str = "flow.f32";
pub const INDIVIDUALS_ENTRY: &str = "individuals.json";
pub const GRAPH_ENTRY: &str = "graph.json";

impl WindowRecord {
    pub fn from_snapshot(snapshot: &WindowSnapshot) -> Result<Self> {
        snapshot.validate()?;
        let seq_len = snapshot.seq_len();
        let (h, w) = (snapshot.frames[0].height(), snapshot.frames[0].width());

        let mut frames = Vec::with_capacity(seq_len * h * w * 3);
        for frame in &snapshot.frames {
            frames.extend(frame.pixels().iter().copied());
        }
        let mut flow = Vec::with_capacity(seq_len * h * w * 2);
        for field in &snapshot.flows {
            flow.extend(field.vectors().iter().copied());
        }

        Ok(Self {
            meta: WindowMeta {
                key: snapshot.key(),
                video_id: snapshot.video_id.clone(),
                window_start: snapshot.window_start(),
                window_end: snapshot.window_end,
                seq_len,
                frame_shape: [seq_len, h, w, 3],
                flow_shape: [seq_len, h, w, 2],
                individual_ids: snapshot.individual_ids(),
            },
            frames,
            flow,
            individuals: build_tracks(&snapshot.detections),
            graph: InteractionGraph::build(&snapshot.detections),
        })
    }

    pub fn key(&self) -> &str {
        &self.meta.key
    }

    pub fn to_payload(&self) -> Result<Payload> {
        let flow_bytes: Vec<u8> = self.flow.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(vec![
            (META_ENTRY.to_string(), serde_json::to_vec(&self.meta)?),
            (FRAMES_ENTRY.to_string(), self.frames.clone()),
            (FLOW_ENTRY.to_string(), flow_bytes),
            (INDIVIDUALS_ENTRY.to_string(), serde_json::to_vec(&self.individuals)?),
            (GRAPH_ENTRY.to_string(), serde_json::to_vec(&self.graph)?),
        ])
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let entry = |name: &str| {
            payload
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, bytes)| bytes.as_slice())
                .ok_or_else(|| WindowingError::shard(format!("record has no {} entry", name)))
        };

        let meta: WindowMeta = serde_json::from_slice(entry(META_ENTRY)?)?;
        let frames = entry(FRAMES_ENTRY)?.to_vec();
        let flow_bytes = entry(FLOW_ENTRY)?;
        if flow_bytes.len() % 4 != 0 {
            return Err(WindowingError::shard(format!(
                "{}: flow entry has {} bytes",
                meta.key,
                flow_bytes.len()
            )));
        }
        let flow = flow_bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            individuals: serde_json::from_slice(entry(INDIVIDUALS_ENTRY)?)?,
            graph: serde_json::from_slice(entry(GRAPH_ENTRY)?)?,
            meta,
            frames,
            flow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Detection;
    use ndarray::Array3;

    fn det(id: u32, x: f32, y: f32) -> Detection {
        Detection::new(
            id,
            BoundingBox::new(x, y, x + 2.0, y + 4.0),
            [[x, y]; NUM_KEYPOINTS],
        )
    }

    fn snapshot(start: usize, detections: Vec<Vec<Detection>>) -> WindowSnapshot {
        let seq_len = detections.len();
        WindowSnapshot {
            video_id: "clip".to_string(),
            window_end: start + seq_len,
            frames: (0..seq_len)
                .map(|t| Frame::new(start + t, Array3::from_elem((2, 3, 3), t as u8)))
                .collect(),
            flows: (0..seq_len)
                .map(|t| FlowField::new(start + t, Array3::from_elem((2, 3, 2), t as f32 * 0.5)))
                .collect(),
            detections: detections
                .into_iter()
                .enumerate()
                .map(|(t, dets)| DetectionSet::new(start + t, dets))
                .collect(),
        }
    }

    #[test]
    fn test_tracks_have_window_length_with_sentinels() {
        let snap = snapshot(
            10,
            vec![
                vec![det(1, 0.0, 0.0)],
                vec![det(1, 1.0, 0.0), det(2, 5.0, 5.0)],
                vec![],
                vec![det(2, 6.0, 5.0)],
            ],
        );
        let tracks = build_tracks(&snap.detections);
        assert_eq!(tracks.len(), 2);
        for track in &tracks {
            assert_eq!(track.len(), 4);
            assert_eq!(track.bboxes.len(), 4);
            assert_eq!(track.keypoints.len(), 4);
        }

        let t2 = &tracks[1];
        assert_eq!(t2.individual_id, 2);
        assert_eq!(t2.present, vec![false, true, false, true]);
        assert_eq!(t2.bboxes[0], [ABSENT; 4]);
        assert_eq!(t2.keypoints[2][16], [ABSENT, ABSENT]);
        assert_eq!(t2.bboxes[3], [6.0, 5.0, 8.0, 9.0]);
        assert_eq!(tracks[0].present_count(), 2);
    }

    #[test]
    fn test_spatial_edges_connect_every_ordered_pair() {
        let graph = InteractionGraph::build(&[
            DetectionSet::new(0, vec![det(1, 0.0, 0.0), det(2, 3.0, 0.0), det(3, 0.0, 8.0)]),
            DetectionSet::new(1, vec![det(1, 0.0, 0.0)]),
        ]);
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.spatial_edges_at(0), 3 * 2);
        assert_eq!(graph.spatial_edges_at(1), 0);
        assert_eq!(graph.spatial_edges.len(), graph.spatial_attrs.len());

        let idx = graph.spatial_edges.iter().position(|e| *e == [0, 2]).unwrap();
        assert_eq!(graph.spatial_attrs[idx], [0.0, 8.0]);
    }

    #[test]
    fn test_temporal_edges_follow_each_individual() {
        let graph = InteractionGraph::build(&[
            DetectionSet::new(0, vec![det(7, 0.0, 0.0)]),
            DetectionSet::new(1, vec![]),
            DetectionSet::new(2, vec![det(7, 4.0, 2.0), det(8, 0.0, 0.0)]),
            DetectionSet::new(3, vec![det(7, 5.0, 2.0)]),
        ]);
        // 7: 0 -> 1 -> 3, both directions; 8 appears once
        assert_eq!(graph.temporal_edges, vec![[0, 1], [1, 0], [1, 3], [3, 1]]);
        // gap of two frames halves the offset
        assert_eq!(graph.temporal_attrs[0], [2.0, 1.0]);
        assert_eq!(graph.temporal_attrs[2], [1.0, 0.0]);
    }

    #[test]
    fn test_validate_rejects_misordered_slots() {
        let mut snap = snapshot(0, vec![vec![], vec![], vec![]]);
        snap.validate().unwrap();
        snap.flows.swap(0, 1);
        assert!(matches!(
            snap.validate(),
            Err(WindowingError::WindowExtraction { .. })
        ));
    }

    #[test]
    fn test_repeated_id_in_frame_is_rejected() {
        let snap = snapshot(0, vec![vec![det(5, 0.0, 0.0)], vec![det(5, 1.0, 0.0), det(5, 9.0, 3.0)]]);
        match snap.validate() {
            Err(WindowingError::WindowExtraction { reason, .. }) => {
                assert!(reason.contains("individual 5"), "{}", reason);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(WindowRecord::from_snapshot(&snap).is_err());

        // the graph alone never links nodes of the same frame in time
        let graph = InteractionGraph::build(&snap.detections);
        assert_eq!(graph.temporal_edges, vec![[0, 1], [1, 0]]);
        assert!(graph.temporal_attrs.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_record_payload_round_trip() {
        let snap = snapshot(30, vec![vec![det(4, 1.0, 1.0)], vec![det(4, 2.0, 1.0)]]);
        let record = WindowRecord::from_snapshot(&snap).unwrap();
        assert_eq!(record.key(), "clip_32");
        assert_eq!(record.meta.window_start, 30);
        assert_eq!(record.meta.frame_shape, [2, 2, 3, 3]);
        assert_eq!(record.frames.len(), 2 * 2 * 3 * 3);
        assert_eq!(record.flow.len(), 2 * 2 * 3 * 2);
        assert_eq!(record.meta.individual_ids, vec![4]);

        let payload = record.to_payload().unwrap();
        let names: Vec<&str> = payload.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![META_ENTRY, FRAMES_ENTRY, FLOW_ENTRY, INDIVIDUALS_ENTRY, GRAPH_ENTRY]
        );
        assert_eq!(WindowRecord::from_payload(&payload).unwrap(), record);
    }
}
