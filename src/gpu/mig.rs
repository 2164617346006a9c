use log::debug;
use roxmltree::{Document, Node, ParsingOptions};
use std::collections::BTreeMap;
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::psutils::parse_pid;
use crate::utils::units::to_mib;

/// One MIG device carved out of a physical GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct MigPartition {
    /// MIG device index within the parent GPU.
    pub mig_device: u32,
    pub gpu_instance: u32,
    pub compute_instance: u32,
    pub sm_count: u32,
    pub total_memory_mib: f64,
}

impl MigPartition {
    fn key(&self) -> (u32, u32) {
        (self.gpu_instance, self.compute_instance)
    }
}

/// A process's share of the MIG partition it runs in.
#[derive(Debug, Clone, PartialEq)]
pub struct MigProcessUsage {
    pub mig_device: u32,
    pub gpu_instance: u32,
    pub compute_instance: u32,
    pub util_percent: f64,
    pub used_mib: f64,
    /// Memory allotment of the partition the process runs in.
    pub partition_mib: f64,
}

/// MIG layout and per-process usage for every GPU with MIG enabled, keyed by
/// GPU index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigTable {
    pub partitions: BTreeMap<u32, Vec<MigPartition>>,
    pub processes: BTreeMap<u32, BTreeMap<u32, MigProcessUsage>>,
    /// Sum of partition SM counts per GPU.
    pub sm_total: BTreeMap<u32, u32>,
}

impl MigTable {
    pub fn usage(&self, gpu_index: u32, pid: u32) -> Option<&MigProcessUsage> {
        self.processes.get(&gpu_index)?.get(&pid)
    }

    pub fn sm_total(&self, gpu_index: u32) -> u32 {
        self.sm_total.get(&gpu_index).copied().unwrap_or(0)
    }
}

/// Parse the `nvidia-smi -q -x` device dump.
pub fn parse_mig_xml(xml: &str) -> Result<MigTable> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let document = Document::parse_with_options(xml, options)?;
    let mut table = MigTable::default();

    for gpu in document.root_element().children().filter(|n| n.has_tag_name("gpu")) {
        let mig_enabled = descendant_text(gpu, "current_mig")
            .is_some_and(|mode| mode.eq_ignore_ascii_case("enabled"));
        if !mig_enabled {
            continue;
        }
        let index = parse_number(gpu, "minor_number")?;

        let partitions = mig_devices(gpu)?;
        table
            .sm_total
            .insert(index, partitions.iter().map(|p| p.sm_count).sum());

        let mut usage = BTreeMap::new();
        for (pid, gpu_instance, compute_instance, used_mib) in mig_processes(gpu) {
            let Some(partition) = partitions
                .iter()
                .find(|p| p.key() == (gpu_instance, compute_instance))
            else {
                continue;
            };
            // nvidia-smi has no per-process SM figure, so a process counts as
            // occupying its whole partition.
            let used_sm = partition.sm_count;
            let util_percent = percent(f64::from(used_sm), f64::from(partition.sm_count));
            usage.insert(
                pid,
                MigProcessUsage {
                    mig_device: partition.mig_device,
                    gpu_instance,
                    compute_instance,
                    util_percent,
                    used_mib,
                    partition_mib: partition.total_memory_mib,
                },
            );
        }
        if !usage.is_empty() {
            table.processes.insert(index, usage);
        }
        table.partitions.insert(index, partitions);
    }
    Ok(table)
}

fn mig_devices(gpu: Node) -> Result<Vec<MigPartition>> {
    let mut partitions = Vec::new();
    for device in gpu.descendants().filter(|n| n.has_tag_name("mig_device")) {
        if find_descendant(device, "shared").is_none() {
            continue;
        }
        let Some(total) = find_descendant(device, "fb_memory_usage")
            .and_then(|fb| child_text(fb, "total"))
        else {
            continue;
        };
        partitions.push(MigPartition {
            mig_device: parse_number(device, "index")?,
            gpu_instance: parse_number(device, "gpu_instance_id")?,
            compute_instance: parse_number(device, "compute_instance_id")?,
            sm_count: descendant_text(device, "multiprocessor_count")
                .and_then(|count| count.parse().ok())
                .ok_or_else(|| missing(device, "multiprocessor_count"))?,
            total_memory_mib: to_mib(total)?,
        });
    }
    Ok(partitions)
}

/// `(pid, gpu instance, compute instance, used MiB)` per listed process.
fn mig_processes(gpu: Node) -> Vec<(u32, u32, u32, f64)> {
    gpu.descendants()
        .filter(|n| n.has_tag_name("process_info"))
        .filter_map(|process| {
            let pid = child_text(process, "pid").and_then(parse_pid)?;
            let used = child_text(process, "used_memory")?;
            let gpu_instance = child_text(process, "gpu_instance_id")?.parse().ok()?;
            let compute_instance = child_text(process, "compute_instance_id")?.parse().ok()?;
            match to_mib(used) {
                Ok(used) => Some((pid, gpu_instance, compute_instance, used)),
                Err(err) => {
                    debug!("Ignoring MIG process {pid}: {err}");
                    None
                }
            }
        })
        .collect()
}

/// Whole percent of `used` in `total`, ties to even.
pub fn percent(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        (used * 100.0 / total).round_ties_even()
    } else {
        0.0
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text()).map(str::trim)
}

fn find_descendant<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.descendants().find(|n| n.has_tag_name(name))
}

fn descendant_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    find_descendant(node, name).and_then(|n| n.text()).map(str::trim)
}

fn parse_number(node: Node, name: &str) -> Result<u32> {
    child_text(node, name)
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| missing(node, name))
}

fn missing(node: Node, name: &str) -> MonitoringError {
    MonitoringError::Parse(format!("<{}> without a numeric <{name}>", node.tag_name().name()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const MIG_XML: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log>
    <driver_version>535.104.05</driver_version>
    <attached_gpus>2</attached_gpus>
    <gpu id="00000000:07:00.0">
        <product_name>NVIDIA A100-SXM4-80GB</product_name>
        <mig_mode>
            <current_mig>Enabled</current_mig>
            <pending_mig>Enabled</pending_mig>
        </mig_mode>
        <mig_devices>
            <mig_device>
                <index>0</index>
                <gpu_instance_id>1</gpu_instance_id>
                <compute_instance_id>0</compute_instance_id>
                <device_attributes>
                    <shared>
                        <multiprocessor_count>42</multiprocessor_count>
                        <copy_engine_count>3</copy_engine_count>
                    </shared>
                </device_attributes>
                <fb_memory_usage>
                    <total>40192 MiB</total>
                    <reserved>0 MiB</reserved>
                    <used>10048 MiB</used>
                    <free>30144 MiB</free>
                </fb_memory_usage>
            </mig_device>
            <mig_device>
                <index>1</index>
                <gpu_instance_id>2</gpu_instance_id>
                <compute_instance_id>0</compute_instance_id>
                <device_attributes>
                    <shared>
                        <multiprocessor_count>28</multiprocessor_count>
                    </shared>
                </device_attributes>
                <fb_memory_usage>
                    <total>19968 MiB</total>
                </fb_memory_usage>
            </mig_device>
        </mig_devices>
        <minor_number>0</minor_number>
        <processes>
            <process_info>
                <gpu_instance_id>1</gpu_instance_id>
                <compute_instance_id>0</compute_instance_id>
                <pid>5000</pid>
                <type>C</type>
                <process_name>python</process_name>
                <used_memory>10048 MiB</used_memory>
            </process_info>
            <process_info>
                <gpu_instance_id>2</gpu_instance_id>
                <compute_instance_id>0</compute_instance_id>
                <pid>6000</pid>
                <type>C</type>
                <process_name>python</process_name>
                <used_memory>4992 MiB</used_memory>
            </process_info>
            <process_info>
                <gpu_instance_id>9</gpu_instance_id>
                <compute_instance_id>0</compute_instance_id>
                <pid>7000</pid>
                <used_memory>1 GiB</used_memory>
            </process_info>
        </processes>
    </gpu>
    <gpu id="00000000:0F:00.0">
        <mig_mode>
            <current_mig>Disabled</current_mig>
        </mig_mode>
        <minor_number>1</minor_number>
        <processes>
            <process_info>
                <gpu_instance_id>N/A</gpu_instance_id>
                <compute_instance_id>N/A</compute_instance_id>
                <pid>8000</pid>
                <used_memory>100 MiB</used_memory>
            </process_info>
        </processes>
    </gpu>
</nvidia_smi_log>
"#;

    #[test]
    fn parses_partitions_of_mig_gpus_only() {
        let table = parse_mig_xml(MIG_XML).unwrap();
        assert_eq!(table.partitions.len(), 1);
        let partitions = &table.partitions[&0];
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].sm_count, 28);
        assert_eq!(partitions[1].total_memory_mib, 19968.0);
        assert_eq!(table.sm_total(0), 70);
        assert_eq!(table.sm_total(1), 0);
    }

    #[test]
    fn active_process_fills_its_partition() {
        let table = parse_mig_xml(MIG_XML).unwrap();
        let usage = table.usage(0, 5000).unwrap();
        assert_eq!(usage.util_percent, 100.0);
        assert_eq!(percent(usage.used_mib, usage.partition_mib), 25.0);
        assert_eq!((usage.gpu_instance, usage.compute_instance), (1, 0));
        assert_eq!((usage.used_mib, usage.partition_mib), (10048.0, 40192.0));

        let usage = table.usage(0, 6000).unwrap();
        assert_eq!(usage.mig_device, 1);
        assert_eq!(percent(usage.used_mib, usage.partition_mib), 25.0);
    }

    #[test]
    fn unmatched_and_non_mig_processes_are_ignored() {
        let table = parse_mig_xml(MIG_XML).unwrap();
        assert!(table.usage(0, 7000).is_none());
        assert!(table.usage(1, 8000).is_none());
    }

    #[test]
    fn percent_ties_go_to_even() {
        assert_eq!(percent(2560.0, 20480.0), 12.0);
        assert_eq!(percent(7680.0, 20480.0), 38.0);
        assert_eq!(percent(1.0, 3.0), 33.0);
        assert_eq!(percent(1.0, 0.0), 0.0);
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_mig_xml("<nvidia_smi_log><gpu>").is_err());
    }
}
