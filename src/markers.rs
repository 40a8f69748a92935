//! Ordered marker list with target and point-of-interest bookkeeping.
//!
//! Marker ids are list positions: they are dense `0..N-1` and are reassigned
//! after every deletion.

use crate::robot::{Robot, RobotObjective};
use crate::session::SessionStore;
use crate::{NavError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const MARKERS_STATE_KEY: &str = "markers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerType {
    Fiducial,
    #[default]
    Landmark,
    BrainTarget,
    CoilTarget,
    CoilPose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Marker {
    /// Position in the list; not persisted.
    #[serde(skip)]
    pub marker_id: usize,
    pub marker_uuid: String,
    pub position: [f64; 3],
    /// `sxyz` degrees; `None` for a position-only landmark.
    pub orientation: Option<[f64; 3]>,
    /// RGB in 0..1.
    pub colour: [f64; 3],
    pub size: f64,
    pub label: String,
    pub marker_type: MarkerType,
    pub is_target: bool,
    pub is_point_of_interest: bool,
    /// Coil this target belongs to in multi-target mode.
    pub coil: Option<String>,
    pub seed: [f64; 3],
    pub session_id: u32,
    pub cortex_position_orientation: [f64; 6],
    pub z_rotation: f64,
    pub z_offset: f64,
    pub mep_value: Option<f64>,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            marker_id: 0,
            marker_uuid: String::new(),
            position: [0.0; 3],
            orientation: None,
            colour: [0.0, 1.0, 0.0],
            size: 2.0,
            label: "*".into(),
            marker_type: MarkerType::default(),
            is_target: false,
            is_point_of_interest: false,
            coil: None,
            seed: [0.0; 3],
            session_id: 1,
            cortex_position_orientation: [0.0; 6],
            z_rotation: 0.0,
            z_offset: 0.0,
            mep_value: None,
        }
    }
}

impl Marker {
    pub fn new(
        position: [f64; 3],
        orientation: Option<[f64; 3]>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            position,
            orientation,
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn coordinate(&self) -> [f64; 6] {
        let [a, b, g] = self.orientation.unwrap_or([0.0; 3]);
        [self.position[0], self.position[1], self.position[2], a, b, g]
    }

    /// Copy that is added as a fresh marker: new uuid, no target or POI flag.
    pub fn duplicate(&self) -> Self {
        Self {
            marker_uuid: String::new(),
            is_target: false,
            is_point_of_interest: false,
            ..self.clone()
        }
    }
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Notification sent to the visualization layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    Added { marker: Marker, render: bool, focus: bool },
    Deleted(Marker),
    DeletedMany(Vec<Marker>),
    TargetSet(Marker),
    TargetUnset(Marker),
    /// Switch the UI into target mode after a target is chosen.
    TargetMode(bool),
    PointOfInterestSet(Marker),
    PointOfInterestUnset(Marker),
    LabelChanged(Marker),
    ColourChanged(Marker),
    MepChanged(Marker),
    /// A deleted marker carried an MEP value.
    MepMappingStale,
    Highlighted(Marker),
    Deselected,
}

pub trait MarkerObserver: Send + Sync {
    fn notify(&self, event: &MarkerEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoObserver;

impl MarkerObserver for NoObserver {
    fn notify(&self, _event: &MarkerEvent) {}
}

pub struct MarkersControl {
    list: Vec<Marker>,
    session: Arc<dyn SessionStore>,
    observer: Arc<dyn MarkerObserver>,
    robot: Option<Arc<Mutex<Robot>>>,
    /// One target per coil instead of one overall.
    multi_target: bool,
    selected: Option<usize>,
}

impl MarkersControl {
    pub fn new(session: Arc<dyn SessionStore>, observer: Arc<dyn MarkerObserver>) -> Self {
        Self {
            list: Vec::new(),
            session,
            observer,
            robot: None,
            multi_target: false,
            selected: None,
        }
    }

    pub fn with_robot(mut self, robot: Arc<Mutex<Robot>>) -> Self {
        self.robot = Some(robot);
        self
    }

    pub fn set_multi_target(&mut self, enabled: bool) {
        self.multi_target = enabled;
    }

    pub fn is_multi_target(&self) -> bool {
        self.multi_target
    }

    pub fn markers(&self) -> &[Marker] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, marker_id: usize) -> Option<&Marker> {
        self.list.get(marker_id)
    }

    fn marker_mut(&mut self, marker_id: usize) -> Result<&mut Marker> {
        self.list
            .get_mut(marker_id)
            .ok_or_else(|| NavError::State(format!("unknown marker id {}", marker_id)))
    }

    fn check_id(&self, marker_id: usize) -> Result<()> {
        if marker_id < self.list.len() {
            Ok(())
        } else {
            Err(NavError::State(format!("unknown marker id {}", marker_id)))
        }
    }

    fn reindex(&mut self) {
        for (idx, marker) in self.list.iter_mut().enumerate() {
            marker.marker_id = idx;
        }
        if self.selected.is_some_and(|s| s >= self.list.len()) {
            self.selected = None;
        }
    }

    pub fn save_state(&self) -> Result<()> {
        self.session
            .set_state(MARKERS_STATE_KEY, serde_json::to_value(&self.list)?)
    }

    pub fn load_state(&mut self) -> Result<()> {
        let Some(value) = self.session.get_state(MARKERS_STATE_KEY) else {
            return Ok(());
        };
        let markers: Vec<Marker> = serde_json::from_value(value)?;
        for marker in markers {
            self.add_marker(marker, false, false)?;
        }
        Ok(())
    }

    /// Append a marker and return its id. Persists only when `render` is set.
    pub fn add_marker(&mut self, mut marker: Marker, render: bool, focus: bool) -> Result<usize> {
        if marker.marker_uuid.is_empty() {
            marker.marker_uuid = new_uuid();
        }
        let marker_id = self.list.len();
        marker.marker_id = marker_id;
        let (is_target, is_poi, has_mep) = (
            marker.is_target,
            marker.is_point_of_interest,
            marker.mep_value.is_some(),
        );
        // Flags are applied through the setters below so the previous holders get unset.
        marker.is_target = false;
        marker.is_point_of_interest = false;
        self.list.push(marker);

        self.observer.notify(&MarkerEvent::Added {
            marker: self.list[marker_id].clone(),
            render,
            focus,
        });
        if is_target {
            self.set_target(marker_id)?;
        }
        if is_poi {
            self.set_point_of_interest(marker_id)?;
        }
        if has_mep {
            self.observer
                .notify(&MarkerEvent::MepChanged(self.list[marker_id].clone()));
        }
        if render {
            self.save_state()?;
        }
        Ok(marker_id)
    }

    pub fn clear(&mut self) -> Result<()> {
        let ids: Vec<usize> = (0..self.list.len()).collect();
        self.delete_multiple(&ids)
    }

    /// Remove one marker, unsetting its target or POI role first.
    pub fn delete_marker(&mut self, marker_id: usize) -> Result<()> {
        let removed = self.remove(marker_id)?;
        self.observer.notify(&MarkerEvent::Deleted(removed.clone()));
        self.reindex();
        if removed.mep_value.is_some() {
            self.observer.notify(&MarkerEvent::MepMappingStale);
        }
        self.save_state()
    }

    fn remove(&mut self, marker_id: usize) -> Result<Marker> {
        self.check_id(marker_id)?;
        if self.list[marker_id].is_target {
            self.unset_target(marker_id)?;
        }
        if self.list[marker_id].is_point_of_interest {
            self.unset_point_of_interest(marker_id)?;
        }
        if self.selected == Some(marker_id) {
            self.selected = None;
        }
        Ok(self.list.remove(marker_id))
    }

    pub fn delete_multiple(&mut self, marker_ids: &[usize]) -> Result<()> {
        let mut ids = marker_ids.to_vec();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        for &id in &ids {
            self.check_id(id)?;
        }

        let mut removed = Vec::with_capacity(ids.len());
        let mut mep_removed = false;
        for id in ids {
            let marker = self.remove(id)?;
            mep_removed |= marker.mep_value.is_some();
            removed.push(marker);
        }
        self.observer.notify(&MarkerEvent::DeletedMany(removed));
        self.reindex();
        if mep_removed {
            self.observer.notify(&MarkerEvent::MepMappingStale);
        }
        self.save_state()
    }

    /// Make `marker_id` the target, replacing the previous one in its scope.
    ///
    /// The scope is the whole list, or the marker's coil in multi-target mode.
    /// Choosing a target always drops the robot back to no objective.
    pub fn set_target(&mut self, marker_id: usize) -> Result<()> {
        self.check_id(marker_id)?;
        if let Some(robot) = &self.robot {
            if let Ok(mut robot) = robot.lock() {
                robot.set_objective(RobotObjective::None);
            }
        }

        let coil = self.list[marker_id].coil.clone();
        if let Some(prev) = self.find_target(coil.as_deref()).map(|m| m.marker_id) {
            if prev == marker_id {
                return Ok(());
            }
            self.unset_target(prev)?;
        }

        let marker = self.marker_mut(marker_id)?;
        marker.is_target = true;
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::TargetSet(marker));
        self.observer.notify(&MarkerEvent::TargetMode(true));
        self.save_state()
    }

    pub fn unset_target(&mut self, marker_id: usize) -> Result<()> {
        let marker = self.marker_mut(marker_id)?;
        marker.is_target = false;
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::TargetUnset(marker));
        self.save_state()
    }

    pub fn set_point_of_interest(&mut self, marker_id: usize) -> Result<()> {
        self.check_id(marker_id)?;
        if let Some(prev) = self.find_point_of_interest().map(|m| m.marker_id) {
            if prev == marker_id {
                return Ok(());
            }
            self.unset_point_of_interest(prev)?;
        }
        let marker = self.marker_mut(marker_id)?;
        marker.is_point_of_interest = true;
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::PointOfInterestSet(marker));
        self.save_state()
    }

    pub fn unset_point_of_interest(&mut self, marker_id: usize) -> Result<()> {
        let marker = self.marker_mut(marker_id)?;
        marker.is_point_of_interest = false;
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::PointOfInterestUnset(marker));
        self.save_state()
    }

    /// Current target. `coil` selects the per-coil target in multi-target mode and is
    /// ignored otherwise.
    pub fn find_target(&self, coil: Option<&str>) -> Option<&Marker> {
        self.list.iter().find(|m| {
            m.is_target && (!self.multi_target || m.coil.as_deref() == coil)
        })
    }

    /// Every target, keyed by coil. Only meaningful in multi-target mode.
    pub fn targets_by_coil(&self) -> Vec<(Option<&str>, &Marker)> {
        self.list
            .iter()
            .filter(|m| m.is_target)
            .map(|m| (m.coil.as_deref(), m))
            .collect()
    }

    pub fn find_point_of_interest(&self) -> Option<&Marker> {
        self.list.iter().find(|m| m.is_point_of_interest)
    }

    pub fn change_label(&mut self, marker_id: usize, label: impl Into<String>) -> Result<()> {
        let marker = self.marker_mut(marker_id)?;
        marker.label = label.into();
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::LabelChanged(marker));
        self.save_state()
    }

    /// `rgb` is 8 bits per channel.
    pub fn change_colour(&mut self, marker_id: usize, rgb: [u8; 3]) -> Result<()> {
        let marker = self.marker_mut(marker_id)?;
        marker.colour = rgb.map(|c| f64::from(c) / 255.0);
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::ColourChanged(marker));
        self.save_state()
    }

    pub fn change_mep(&mut self, marker_id: usize, mep: Option<f64>) -> Result<()> {
        let marker = self.marker_mut(marker_id)?;
        marker.mep_value = mep;
        let marker = marker.clone();
        self.observer.notify(&MarkerEvent::MepChanged(marker));
        self.save_state()
    }

    /// First unused label of the form "New marker", "New marker 2", ...
    pub fn next_marker_label(&self) -> String {
        let mut label = "New marker".to_string();
        let mut i = 1;
        while self.list.iter().any(|m| m.label == label) {
            i += 1;
            label = format!("New marker {}", i);
        }
        label
    }

    pub fn delete_brain_targets(&mut self) -> Result<()> {
        while let Some(id) = self
            .list
            .iter()
            .position(|m| m.marker_type == MarkerType::BrainTarget)
        {
            self.delete_marker(id)?;
        }
        Ok(())
    }

    pub fn select_marker(&mut self, marker_id: usize) -> Result<()> {
        self.check_id(marker_id)?;
        self.selected = Some(marker_id);
        self.observer
            .notify(&MarkerEvent::Highlighted(self.list[marker_id].clone()));
        Ok(())
    }

    pub fn deselect_marker(&mut self) {
        self.selected = None;
        self.observer.notify(&MarkerEvent::Deselected);
    }

    pub fn selected(&self) -> Option<&Marker> {
        self.selected.and_then(|id| self.list.get(id))
    }

    pub fn create_coil_target_from_coil_pose(&mut self, marker_id: usize) -> Result<usize> {
        self.check_id(marker_id)?;
        let mut marker = self.list[marker_id].duplicate();
        marker.marker_type = MarkerType::CoilTarget;
        self.add_marker(marker, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elfin::RobotApi;
    use crate::robot::RobotApiFactory;
    use crate::session::MemorySession;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MarkerEvent>>);

    impl Recorder {
        fn names(&self) -> Vec<&'static str> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|e| match e {
                    MarkerEvent::Added { .. } => "added",
                    MarkerEvent::Deleted(_) => "deleted",
                    MarkerEvent::DeletedMany(_) => "deleted_many",
                    MarkerEvent::TargetSet(_) => "target_set",
                    MarkerEvent::TargetUnset(_) => "target_unset",
                    MarkerEvent::TargetMode(_) => "target_mode",
                    MarkerEvent::PointOfInterestSet(_) => "poi_set",
                    MarkerEvent::PointOfInterestUnset(_) => "poi_unset",
                    MarkerEvent::LabelChanged(_) => "label",
                    MarkerEvent::ColourChanged(_) => "colour",
                    MarkerEvent::MepChanged(_) => "mep",
                    MarkerEvent::MepMappingStale => "mep_stale",
                    MarkerEvent::Highlighted(_) => "highlight",
                    MarkerEvent::Deselected => "deselect",
                })
                .collect()
        }

        fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    impl MarkerObserver for Recorder {
        fn notify(&self, event: &MarkerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn control() -> (MarkersControl, Arc<Recorder>, Arc<dyn SessionStore>) {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let recorder = Arc::new(Recorder::default());
        let control = MarkersControl::new(session.clone(), recorder.clone());
        (control, recorder, session)
    }

    fn add(control: &mut MarkersControl, label: &str) -> usize {
        control
            .add_marker(Marker::new([1.0, 2.0, 3.0], Some([0.0; 3]), label), true, false)
            .unwrap()
    }

    #[test]
    fn test_ids_are_dense_after_deletions() {
        let (mut control, _, _) = control();
        for i in 0..6 {
            add(&mut control, &format!("m{}", i));
        }
        control.delete_marker(1).unwrap();
        control.delete_multiple(&[0, 3, 3]).unwrap();

        let ids: Vec<usize> = control.markers().iter().map(|m| m.marker_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let labels: Vec<&str> = control.markers().iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["m2", "m3", "m5"]);
    }

    #[test]
    fn test_deleting_target_unsets_it_first() {
        let (mut control, recorder, _) = control();
        add(&mut control, "a");
        let target = add(&mut control, "b");
        control.set_target(target).unwrap();
        recorder.clear();

        control.delete_marker(target).unwrap();
        assert_eq!(recorder.names(), vec!["target_unset", "deleted"]);
        assert!(control.find_target(None).is_none());
    }

    #[test]
    fn test_single_target_replaces_previous() {
        let (mut control, recorder, _) = control();
        let a = add(&mut control, "a");
        let b = add(&mut control, "b");
        control.set_target(a).unwrap();
        recorder.clear();

        control.set_target(b).unwrap();
        assert_eq!(recorder.names(), vec!["target_unset", "target_set", "target_mode"]);
        assert_eq!(control.find_target(None).map(|m| m.marker_id), Some(b));
        assert!(!control.markers()[a].is_target);

        recorder.clear();
        control.set_target(b).unwrap();
        assert!(recorder.names().is_empty());
    }

    #[test]
    fn test_multi_target_keeps_one_target_per_coil() {
        let (mut control, _, _) = control();
        control.set_multi_target(true);
        for (label, coil) in [("a", "left"), ("b", "right"), ("c", "left")] {
            let mut marker = Marker::new([0.0; 3], None, label);
            marker.coil = Some(coil.into());
            control.add_marker(marker, true, false).unwrap();
        }
        control.set_target(0).unwrap();
        control.set_target(1).unwrap();
        control.set_target(2).unwrap();

        assert_eq!(control.find_target(Some("left")).map(|m| m.marker_id), Some(2));
        assert_eq!(control.find_target(Some("right")).map(|m| m.marker_id), Some(1));
        assert_eq!(control.targets_by_coil().len(), 2);
    }

    #[test]
    fn test_single_point_of_interest() {
        let (mut control, _, _) = control();
        let a = add(&mut control, "a");
        let b = add(&mut control, "b");
        control.set_point_of_interest(a).unwrap();
        control.set_point_of_interest(b).unwrap();
        assert_eq!(control.find_point_of_interest().map(|m| m.marker_id), Some(b));
        assert!(!control.markers()[a].is_point_of_interest);
        control.unset_point_of_interest(b).unwrap();
        assert!(control.find_point_of_interest().is_none());
    }

    #[test]
    fn test_state_round_trip_restores_flags() {
        let (mut control, _, session) = control();
        let a = add(&mut control, "a");
        add(&mut control, "b");
        control.set_target(a).unwrap();
        control.change_colour(1, [255, 0, 0]).unwrap();
        control.change_mep(1, Some(120.0)).unwrap();

        let mut restored = MarkersControl::new(session, Arc::new(NoObserver));
        restored.load_state().unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.markers()[0].is_target);
        assert_eq!(restored.markers()[1].colour, [1.0, 0.0, 0.0]);
        assert_eq!(restored.markers()[1].mep_value, Some(120.0));
        assert_eq!(restored.markers()[0].marker_uuid, control.markers()[0].marker_uuid);
    }

    #[test]
    fn test_labels_and_brain_targets() {
        let (mut control, _, _) = control();
        assert_eq!(control.next_marker_label(), "New marker");
        add(&mut control, "New marker");
        add(&mut control, "New marker 2");
        assert_eq!(control.next_marker_label(), "New marker 3");

        for _ in 0..2 {
            let mut marker = Marker::new([0.0; 3], None, "bt");
            marker.marker_type = MarkerType::BrainTarget;
            control.add_marker(marker, true, false).unwrap();
        }
        control.delete_brain_targets().unwrap();
        assert_eq!(control.len(), 2);
        control.clear().unwrap();
        assert!(control.is_empty());
    }

    #[test]
    fn test_coil_target_from_pose_is_new_marker() {
        let (mut control, recorder, _) = control();
        let mut pose = Marker::new([5.0; 3], Some([10.0, 20.0, 30.0]), "pose");
        pose.marker_type = MarkerType::CoilPose;
        let pose_id = control.add_marker(pose, true, false).unwrap();
        let id = control.create_coil_target_from_coil_pose(pose_id).unwrap();

        let created = &control.markers()[id];
        assert_eq!(created.marker_type, MarkerType::CoilTarget);
        assert_eq!(created.orientation, Some([10.0, 20.0, 30.0]));
        assert_ne!(created.marker_uuid, control.markers()[pose_id].marker_uuid);
        let uuid = Uuid::parse_str(&created.marker_uuid).unwrap();
        assert_eq!(uuid.get_version_num(), 4);

        control.select_marker(id).unwrap();
        assert_eq!(control.selected().map(|m| m.marker_id), Some(id));
        control.deselect_marker();
        assert!(recorder.names().ends_with(&["highlight", "deselect"]));
    }

    #[test]
    fn test_unknown_id_is_state_error() {
        let (mut control, _, _) = control();
        assert!(matches!(control.delete_marker(0), Err(NavError::State(_))));
        assert!(matches!(control.set_target(3), Err(NavError::State(_))));
    }

    #[test]
    fn test_setting_target_clears_robot_objective() {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let factory: RobotApiFactory = Arc::new(|ip: &str| -> Result<Box<dyn RobotApi>> {
            Err(NavError::Configuration(format!("offline {}", ip)))
        });
        let robot = Arc::new(Mutex::new(Robot::new(session.clone(), factory)));
        robot.lock().unwrap().set_objective(RobotObjective::TrackTarget);

        let mut control =
            MarkersControl::new(session, Arc::new(NoObserver)).with_robot(robot.clone());
        let id = add(&mut control, "t");
        control.set_target(id).unwrap();
        assert_eq!(robot.lock().unwrap().objective(), RobotObjective::None);
    }
}
