// src/scan_plan.rs - Tag tree flattening and block read planning
//
// Turns the nested tag tree of one device into flat `TagSpec`s and merges
// their register footprints into the smallest set of contiguous block reads.

use crate::{
    config::ScanConfig,
    error::{PlcError, Result},
    value::{self, Reading, Scaling},
};
use chrono::{DateTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// First address of the human 4xxxx holding register numbering.
pub const ADDRESS_4X_BASE: u32 = 40001;

/// Highest bit index inside a 16-bit register.
pub const MAX_BIT: u8 = 15;

/// Smallest block size that still fits a two-register REAL.
pub const MIN_BLOCK_SIZE: u16 = 2;

// ============================================================================
// TAG TREE
// ============================================================================

/// Register encoding of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    /// One unsigned 16-bit register
    Integer,
    /// IEEE-754 single precision over two registers, high word first
    Real,
    /// One register read as 16 labelled bits
    Digital,
}

impl DataType {
    /// Number of holding registers a value of this type occupies.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Real => 2,
            DataType::Integer | DataType::Digital => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Digital => "DIGITAL",
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => Ok(DataType::Integer),
            "REAL" => Ok(DataType::Real),
            "DIGITAL" => Ok(DataType::Digital),
            other => Err(format!(
                "unsupported data type '{}' (expected INTEGER, REAL or DIGITAL)",
                other
            )),
        }
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaf of the tag tree as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TagDefinition {
    /// Human 4xxxx address
    pub address: u32,

    #[serde(rename = "type")]
    pub data_type: DataType,

    #[serde(default)]
    pub description: Option<String>,

    /// Engineering unit, informational only
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub raw_zero_scale: Option<f64>,
    #[serde(default)]
    pub raw_full_scale: Option<f64>,
    #[serde(default)]
    pub eng_zero_scale: Option<f64>,
    #[serde(default)]
    pub eng_full_scale: Option<f64>,

    /// `"BIT 9": "PUMP ON"` style labels for DIGITAL tags
    #[serde(default)]
    pub bits: Option<BTreeMap<String, String>>,
}

/// A node of the hierarchical tag tree.
///
/// A mapping that carries an `address` key is a leaf; any other mapping is a
/// group whose mapping-valued entries are children, kept in the order they
/// were written.
#[derive(Debug, Clone, PartialEq)]
pub enum TagNode {
    Leaf(TagDefinition),
    Group(Vec<(String, TagNode)>),
}

impl Default for TagNode {
    fn default() -> Self {
        TagNode::Group(Vec::new())
    }
}

impl TagNode {
    /// Parse a node from an already loaded YAML value.
    pub fn from_yaml_value(value: YamlValue) -> Result<Self> {
        let mut path = Vec::new();
        Self::parse(value, &mut path)
    }

    fn parse(value: YamlValue, path: &mut Vec<String>) -> Result<Self> {
        let mapping = match value {
            YamlValue::Mapping(mapping) => mapping,
            YamlValue::Null => Mapping::new(),
            other => {
                return Err(PlcError::Config(format!(
                    "tag node '{}' must be a mapping, found {:?}",
                    path.join("/"),
                    other
                )))
            }
        };

        if mapping.contains_key("address") {
            let definition: TagDefinition = serde_yaml::from_value(YamlValue::Mapping(mapping))
                .map_err(|e| PlcError::Config(format!("tag '{}': {}", path.join("/"), e)))?;
            return Ok(TagNode::Leaf(definition));
        }

        let mut children = Vec::with_capacity(mapping.len());
        for (key, child) in mapping {
            let name = match key {
                YamlValue::String(s) => s,
                YamlValue::Number(n) => n.to_string(),
                other => {
                    return Err(PlcError::Config(format!(
                        "tag group '{}' has a non-scalar key {:?}",
                        path.join("/"),
                        other
                    )))
                }
            };

            // Scalars on a group are annotations, not children
            if !matches!(child, YamlValue::Mapping(_)) {
                debug!("Ignoring attribute '{}' on tag group '{}'", name, path.join("/"));
                continue;
            }

            path.push(name.clone());
            let node = Self::parse(child, path)?;
            path.pop();
            children.push((name, node));
        }

        Ok(TagNode::Group(children))
    }
}

impl<'de> Deserialize<'de> for TagNode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = YamlValue::deserialize(deserializer)?;
        TagNode::from_yaml_value(value).map_err(D::Error::custom)
    }
}

// ============================================================================
// TAG SPECS
// ============================================================================

/// Immutable register footprint of one leaf tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSpec {
    pub path: Vec<String>,
    pub address_4x: u32,
    pub data_type: DataType,
    /// Native address of the configured 4xxxx address
    pub base_address: u16,
    /// First native register read for this tag
    pub read_address: u16,
    pub read_count: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bits: BTreeMap<u8, String>,
}

impl TagSpec {
    /// Build a spec from its configured definition.
    pub fn from_definition(path: Vec<String>, definition: &TagDefinition) -> Result<Self> {
        let key = path.join("/");
        let (read_address, read_count) = read_range(definition.address, definition.data_type)
            .map_err(|e| PlcError::Config(format!("tag '{}': {}", key, e)))?;
        let base_address = native_address(definition.address)
            .map_err(|e| PlcError::Config(format!("tag '{}': {}", key, e)))?;

        let mut bits = BTreeMap::new();
        if let Some(labels) = &definition.bits {
            for (raw_key, label) in labels {
                let bit = parse_bit_key(raw_key).ok_or_else(|| {
                    PlcError::Config(format!("tag '{}': invalid bit key '{}'", key, raw_key))
                })?;
                bits.insert(bit, label.clone());
            }
        }

        Ok(Self {
            path,
            address_4x: definition.address,
            data_type: definition.data_type,
            base_address,
            read_address,
            read_count,
            description: definition.description.clone(),
            unit: definition.unit.clone(),
            scaling: Scaling::from_parts(
                definition.raw_zero_scale,
                definition.raw_full_scale,
                definition.eng_zero_scale,
                definition.eng_full_scale,
            ),
            bits,
        })
    }

    /// Path joined with `/`, the key readings and rules refer to.
    pub fn key(&self) -> String {
        self.path.join("/")
    }

    /// Last native register of the footprint (inclusive).
    pub fn end_address(&self) -> u32 {
        u32::from(self.read_address) + u32::from(self.read_count) - 1
    }
}

/// Translate a human 4xxxx address to the native protocol address.
///
/// The mapping is `address - 40001 + 1`, one above the usual zero-based
/// convention. Existing tag addresses depend on it, so it must stay as is.
pub fn native_address(address_4x: u32) -> std::result::Result<u16, String> {
    let native = i64::from(address_4x) - i64::from(ADDRESS_4X_BASE) + 1;
    u16::try_from(native).map_err(|_| {
        format!(
            "address {} is outside the 4xxxx holding register range",
            address_4x
        )
    })
}

/// Native `(start, count)` a tag of `data_type` at `address_4x` must read.
///
/// REAL values start one register after the translated address.
pub fn read_range(address_4x: u32, data_type: DataType) -> std::result::Result<(u16, u16), String> {
    let base = native_address(address_4x)?;
    let count = data_type.register_count();
    let start = match data_type {
        DataType::Real => u32::from(base) + 1,
        DataType::Integer | DataType::Digital => u32::from(base),
    };
    let end = start + u32::from(count) - 1;
    if end > u32::from(u16::MAX) {
        return Err(format!(
            "address {} ({}) runs past the last register",
            address_4x, data_type
        ));
    }
    Ok((start as u16, count))
}

fn parse_bit_key(raw: &str) -> Option<u8> {
    let trimmed = raw.trim();
    let digits = if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("bit") {
        trimmed[3..].trim()
    } else {
        trimmed
    };
    digits.parse::<u8>().ok().filter(|bit| *bit <= MAX_BIT)
}

/// Flatten a tag tree into specs, in tree order.
pub fn flatten(tree: &TagNode) -> Result<Vec<TagSpec>> {
    if let TagNode::Leaf(_) = tree {
        return Err(PlcError::Config(
            "tag tree root must be a group, not a single tag".to_string(),
        ));
    }
    let mut tags = Vec::new();
    let mut path = Vec::new();
    flatten_into(tree, &mut path, &mut tags)?;
    Ok(tags)
}

fn flatten_into(node: &TagNode, path: &mut Vec<String>, out: &mut Vec<TagSpec>) -> Result<()> {
    match node {
        TagNode::Leaf(definition) => {
            out.push(TagSpec::from_definition(path.clone(), definition)?);
        }
        TagNode::Group(children) => {
            for (name, child) in children {
                path.push(name.clone());
                flatten_into(child, path, out)?;
                path.pop();
            }
        }
    }
    Ok(())
}

// ============================================================================
// BLOCK PLANNING
// ============================================================================

/// One contiguous holding register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReadBlock {
    pub address: u16,
    pub count: u16,
}

impl ReadBlock {
    pub fn new(address: u16, count: u16) -> Self {
        Self { address, count }
    }

    /// Last native register of the block (inclusive).
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.count) - 1
    }

    /// Whether the whole footprint of `tag` lies inside this block.
    pub fn contains(&self, tag: &TagSpec) -> bool {
        tag.read_address >= self.address && tag.end_address() <= self.end_address()
    }
}

/// Merge tag footprints into block reads.
///
/// Footprints are sorted by `(start, end)` and swept once. The next footprint
/// joins the current window when it starts at most `max_gap` registers after
/// the window's end and the merged window stays within `max_block_size`.
/// A `max_block_size` below [`MIN_BLOCK_SIZE`] is rejected, since a REAL could
/// not fit in one block.
pub fn build_blocks(tags: &[TagSpec], max_block_size: u16, max_gap: u16) -> Result<Vec<ReadBlock>> {
    if max_block_size < MIN_BLOCK_SIZE {
        return Err(PlcError::Config(format!(
            "max_block_size must be at least {}, got {}",
            MIN_BLOCK_SIZE, max_block_size
        )));
    }

    let mut ranges: Vec<(u32, u32)> = tags
        .iter()
        .map(|t| (u32::from(t.read_address), t.end_address()))
        .collect();

    if ranges.is_empty() {
        return Ok(Vec::new());
    }

    ranges.sort_unstable();

    let max_len = u32::from(max_block_size);
    let mut blocks = Vec::new();
    let (mut cur_start, mut cur_end) = ranges[0];

    for &(start, end) in &ranges[1..] {
        let merged_end = cur_end.max(end);
        let merged_len = merged_end - cur_start + 1;

        if start <= cur_end + 1 + u32::from(max_gap) && merged_len <= max_len {
            cur_end = merged_end;
        } else {
            blocks.push(window(cur_start, cur_end));
            cur_start = start;
            cur_end = end;
        }
    }
    blocks.push(window(cur_start, cur_end));

    Ok(blocks)
}

fn window(start: u32, end: u32) -> ReadBlock {
    // Footprints are validated to lie within u16 when specs are built
    ReadBlock::new(start as u16, (end - start + 1) as u16)
}

// ============================================================================
// SCAN PLAN
// ============================================================================

/// Tags and block reads for one device, rebuilt wholesale on config change.
#[derive(Debug, Clone, Serialize)]
pub struct ScanPlan {
    pub tags: Vec<TagSpec>,
    pub blocks: Vec<ReadBlock>,
}

impl ScanPlan {
    /// Flatten `tree` and plan its block reads.
    pub fn build(tree: &TagNode, scan: &ScanConfig) -> Result<Self> {
        let tags = flatten(tree)?;
        Self::from_tags(tags, scan.max_block_size, scan.max_gap)
    }

    pub fn from_tags(tags: Vec<TagSpec>, max_block_size: u16, max_gap: u16) -> Result<Self> {
        let blocks = build_blocks(&tags, max_block_size, max_gap)?;
        info!("Built scan plan: {} tags -> {} block reads", tags.len(), blocks.len());
        Ok(Self { tags, blocks })
    }

    pub fn find(&self, key: &str) -> Option<&TagSpec> {
        self.tags.iter().find(|t| t.key() == key)
    }

    /// Decode every tag whose footprint lies inside `block`.
    pub fn decode<'a>(
        &'a self,
        block: &ReadBlock,
        registers: &[u16],
        timestamp: DateTime<Utc>,
    ) -> Vec<(&'a TagSpec, Reading)> {
        if registers.len() < usize::from(block.count) {
            warn!(
                "Short read for block {}+{}: got {} registers",
                block.address,
                block.count,
                registers.len()
            );
        }

        let mut out = Vec::new();
        for tag in self.tags.iter().filter(|t| block.contains(t)) {
            let offset = usize::from(tag.read_address - block.address);
            let Some(words) = registers.get(offset..offset + usize::from(tag.read_count)) else {
                continue;
            };
            match value::decode(tag, words, timestamp) {
                Some(reading) => out.push((tag, reading)),
                None => warn!("Tag '{}' decoded to no value (raw {:?})", tag.key(), words),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_at(native: u16, data_type: DataType) -> TagSpec {
        let definition = TagDefinition {
            address: u32::from(native) + ADDRESS_4X_BASE - 1,
            data_type,
            description: None,
            unit: None,
            raw_zero_scale: None,
            raw_full_scale: None,
            eng_zero_scale: None,
            eng_full_scale: None,
            bits: None,
        };
        let mut spec = TagSpec::from_definition(vec![format!("t{}", native)], &definition).unwrap();
        // Place REAL footprints exactly at `native` for block tests
        spec.read_address = native;
        spec
    }

    #[test]
    fn test_address_translation() {
        assert_eq!(native_address(40001).unwrap(), 1);
        assert_eq!(native_address(40000).unwrap(), 0);
        assert_eq!(read_range(40001, DataType::Real).unwrap(), (2, 2));
        assert_eq!(read_range(40001, DataType::Integer).unwrap(), (1, 1));
        assert_eq!(read_range(40001, DataType::Digital).unwrap(), (1, 1));
        assert_eq!(read_range(41226, DataType::Real).unwrap(), (1227, 2));
    }

    #[test]
    fn test_address_out_of_range() {
        assert!(native_address(39999).is_err());
        assert!(native_address(40000 + 65536).is_err());
        // REAL footprint would need register 65536
        assert!(read_range(40000 + 65535, DataType::Real).is_err());
    }

    #[test]
    fn test_adjacent_tags_merge() {
        let tags = vec![
            tag_at(10, DataType::Integer),
            tag_at(11, DataType::Integer),
            tag_at(12, DataType::Integer),
        ];
        assert_eq!(build_blocks(&tags, 120, 2).unwrap(), vec![ReadBlock::new(10, 3)]);
    }

    #[test]
    fn test_distant_tags_split() {
        let tags = vec![tag_at(10, DataType::Integer), tag_at(50, DataType::Integer)];
        assert_eq!(
            build_blocks(&tags, 120, 2).unwrap(),
            vec![ReadBlock::new(10, 1), ReadBlock::new(50, 1)]
        );
    }

    #[test]
    fn test_gap_tolerance_boundary() {
        // 10 ends at 10; 13 starts exactly max_gap=2 past the end
        let tags = vec![tag_at(10, DataType::Integer), tag_at(13, DataType::Integer)];
        assert_eq!(build_blocks(&tags, 120, 2).unwrap(), vec![ReadBlock::new(10, 4)]);

        let tags = vec![tag_at(10, DataType::Integer), tag_at(14, DataType::Integer)];
        assert_eq!(build_blocks(&tags, 120, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_block_size_limit_splits() {
        let tags: Vec<_> = (0..10).map(|i| tag_at(100 + i, DataType::Integer)).collect();
        let blocks = build_blocks(&tags, 4, 2).unwrap();
        assert_eq!(
            blocks,
            vec![
                ReadBlock::new(100, 4),
                ReadBlock::new(104, 4),
                ReadBlock::new(108, 2)
            ]
        );
        assert!(blocks.iter().all(|b| b.count <= 4));
    }

    #[test]
    fn test_real_tag_kept_whole() {
        let tags = vec![
            tag_at(10, DataType::Integer),
            tag_at(11, DataType::Integer),
            tag_at(12, DataType::Real),
        ];
        // 10..=13 would be 4 registers, over the limit of 3
        assert_eq!(
            build_blocks(&tags, 3, 2).unwrap(),
            vec![ReadBlock::new(10, 2), ReadBlock::new(12, 2)]
        );
    }

    #[test]
    fn test_empty_and_single() {
        assert!(build_blocks(&[], 120, 2).unwrap().is_empty());
        assert_eq!(
            build_blocks(&[tag_at(7, DataType::Real)], 120, 2).unwrap(),
            vec![ReadBlock::new(7, 2)]
        );
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let forward = vec![
            tag_at(5, DataType::Integer),
            tag_at(6, DataType::Real),
            tag_at(20, DataType::Digital),
            tag_at(21, DataType::Integer),
            tag_at(90, DataType::Real),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        let mut rotated = forward.clone();
        rotated.rotate_left(2);

        let expected = build_blocks(&forward, 120, 2).unwrap();
        assert_eq!(build_blocks(&reversed, 120, 2).unwrap(), expected);
        assert_eq!(build_blocks(&rotated, 120, 2).unwrap(), expected);
    }

    #[test]
    fn test_overlapping_footprints() {
        // Same register requested twice
        let tags = vec![tag_at(30, DataType::Real), tag_at(31, DataType::Integer)];
        assert_eq!(build_blocks(&tags, 120, 0).unwrap(), vec![ReadBlock::new(30, 2)]);
    }

    #[test]
    fn test_block_size_below_minimum_rejected() {
        let tags = vec![tag_at(30, DataType::Real)];
        assert!(matches!(build_blocks(&tags, 1, 2), Err(PlcError::Config(_))));
        assert!(matches!(build_blocks(&[], 0, 2), Err(PlcError::Config(_))));
        assert!(ScanPlan::from_tags(tags.clone(), 1, 2).is_err());
        assert_eq!(
            build_blocks(&tags, MIN_BLOCK_SIZE, 2).unwrap(),
            vec![ReadBlock::new(30, 2)]
        );
    }

    #[test]
    fn test_flatten_keeps_tree_order() {
        let yaml = r#"
compressors:
  comp_2:
    suction_pressure: { address: 41226, type: REAL, unit: bar }
  comp_1:
    status: { address: 40100, type: digital, bits: { "BIT 0": RUNNING, "BIT 9": PUMP ON } }
    hours: { address: 40101, type: INTEGER }
    label: "not a tag"
"#;
        let tree: TagNode = serde_yaml::from_str(yaml).unwrap();
        let tags = flatten(&tree).unwrap();
        let keys: Vec<_> = tags.iter().map(|t| t.key()).collect();
        assert_eq!(
            keys,
            vec![
                "compressors/comp_2/suction_pressure",
                "compressors/comp_1/status",
                "compressors/comp_1/hours",
            ]
        );

        assert_eq!(tags[0].data_type, DataType::Real);
        assert_eq!(tags[0].base_address, 1226);
        assert_eq!((tags[0].read_address, tags[0].read_count), (1227, 2));
        assert_eq!(tags[1].bits.get(&9).map(String::as_str), Some("PUMP ON"));
        assert_eq!(tags[1].bits.get(&0).map(String::as_str), Some("RUNNING"));
    }

    #[test]
    fn test_malformed_trees_rejected() {
        assert!(serde_yaml::from_str::<TagNode>("a: { x: { address: 40001, type: DOUBLE } }").is_err());
        assert!(serde_yaml::from_str::<TagNode>("a: { x: { address: 40001 } }").is_err());

        let low: TagNode = serde_yaml::from_str("a: { x: { address: 30001, type: INTEGER } }").unwrap();
        assert!(matches!(flatten(&low), Err(PlcError::Config(_))));

        let bad_bit: TagNode =
            serde_yaml::from_str("a: { x: { address: 40001, type: DIGITAL, bits: { \"BIT 16\": X } } }")
                .unwrap();
        assert!(matches!(flatten(&bad_bit), Err(PlcError::Config(_))));

        let leaf_root: TagNode = serde_yaml::from_str("{ address: 40001, type: INTEGER }").unwrap();
        assert!(flatten(&leaf_root).is_err());
    }

    #[test]
    fn test_bit_key_forms() {
        assert_eq!(parse_bit_key("BIT 9"), Some(9));
        assert_eq!(parse_bit_key("bit3"), Some(3));
        assert_eq!(parse_bit_key("15"), Some(15));
        assert_eq!(parse_bit_key("16"), None);
        assert_eq!(parse_bit_key("pump"), None);
    }

    #[test]
    fn test_decode_tags_in_block() {
        let yaml = r#"
line:
  speed: { address: 40010, type: INTEGER }
  temp: { address: 40011, type: REAL }
"#;
        let tree: TagNode = serde_yaml::from_str(yaml).unwrap();
        let plan = ScanPlan::from_tags(flatten(&tree).unwrap(), 120, 2).unwrap();
        assert_eq!(plan.blocks, vec![ReadBlock::new(10, 4)]);

        // speed @10, gap @11, temp @12..=13 (41.6 = 0x4226_6666)
        let registers = [1500, 0, 0x4226, 0x6666];
        let readings = plan.decode(&plan.blocks[0], &registers, Utc::now());
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].1.value.as_float(), Some(1500.0));
        let temp = readings[1].1.value.as_float().unwrap();
        assert!((temp - 41.6).abs() < 1e-4);
    }

    #[test]
    fn test_decode_short_read_skips_missing_tags() {
        let tags = vec![tag_at(10, DataType::Integer), tag_at(11, DataType::Integer)];
        let plan = ScanPlan::from_tags(tags, 120, 2).unwrap();
        let readings = plan.decode(&plan.blocks[0], &[42], Utc::now());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].0.key(), "t10");
    }
}
