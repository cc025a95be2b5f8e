//! Volumes shared by every workload of a version

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, Volume, VolumeMount,
};

use crate::config::WorkloadSettings;

pub const PIPELINE_FILES_VOLUME: &str = "pipeline-files";
pub const CONF_FILES_VOLUME: &str = "version-conf-files";
pub const APP_LOG_VOLUME: &str = "app-log-volume";

/// Scratch space, conf files and logs, identical for every workload
pub fn common_volumes(conf_files_config_map: &str) -> Vec<Volume> {
    vec![
        Volume {
            name: PIPELINE_FILES_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: CONF_FILES_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: conf_files_config_map.to_string().into(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: APP_LOG_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

pub fn common_volume_mounts(settings: &WorkloadSettings) -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: PIPELINE_FILES_VOLUME.to_string(),
            mount_path: settings.pipeline_files_path.clone(),
            read_only: Some(false),
            ..Default::default()
        },
        VolumeMount {
            name: CONF_FILES_VOLUME.to_string(),
            mount_path: settings.conf_path.clone(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: APP_LOG_VOLUME.to_string(),
            mount_path: settings.log_path.clone(),
            read_only: Some(false),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mount_has_a_volume() {
        let volumes = common_volumes("p1-v1-conf-files");
        let mounts = common_volume_mounts(&WorkloadSettings::default());
        assert_eq!(volumes.len(), mounts.len());
        for mount in &mounts {
            assert!(volumes.iter().any(|v| v.name == mount.name));
        }
    }

    #[test]
    fn test_conf_files_volume_is_read_only_config_map() {
        let volumes = common_volumes("p1-v1-conf-files");
        let conf = volumes
            .iter()
            .find(|v| v.name == CONF_FILES_VOLUME)
            .unwrap();
        assert!(conf.config_map.is_some());

        let mounts = common_volume_mounts(&WorkloadSettings::default());
        let mount = mounts.iter().find(|m| m.name == CONF_FILES_VOLUME).unwrap();
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(mount.mount_path, "/conf");
    }
}
