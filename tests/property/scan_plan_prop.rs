use proptest::prelude::*;
use regscan::scan_plan::{build_blocks, DataType, TagDefinition, TagSpec};

fn tag(index: usize, address: u32, real: bool) -> TagSpec {
    let definition = TagDefinition {
        address,
        data_type: if real { DataType::Real } else { DataType::Integer },
        description: None,
        unit: None,
        raw_zero_scale: None,
        raw_full_scale: None,
        eng_zero_scale: None,
        eng_full_scale: None,
        bits: None,
    };
    TagSpec::from_definition(vec![format!("t{}", index)], &definition).unwrap()
}

fn tags_strategy() -> impl Strategy<Value = Vec<TagSpec>> {
    prop::collection::vec((40001u32..41000, any::<bool>()), 0..60).prop_map(|defs| {
        defs.into_iter()
            .enumerate()
            .map(|(i, (address, real))| tag(i, address, real))
            .collect()
    })
}

proptest! {
    #[test]
    fn test_every_tag_is_covered_by_a_block(
        tags in tags_strategy(),
        max_block_size in 2u16..=125,
        max_gap in 0u16..10,
    ) {
        let blocks = build_blocks(&tags, max_block_size, max_gap).unwrap();
        for tag in &tags {
            prop_assert!(
                blocks.iter().any(|b| b.contains(tag)),
                "tag {:?} at {} not covered by {:?}",
                tag.path, tag.read_address, blocks
            );
        }
    }

    #[test]
    fn test_blocks_respect_size_limit(
        tags in tags_strategy(),
        max_block_size in 2u16..=125,
        max_gap in 0u16..10,
    ) {
        let blocks = build_blocks(&tags, max_block_size, max_gap).unwrap();
        prop_assert!(blocks.len() <= tags.len());
        for block in &blocks {
            prop_assert!(block.count >= 1);
            prop_assert!(block.count <= max_block_size);
        }
        for pair in blocks.windows(2) {
            prop_assert!(pair[0].address < pair[1].address);
        }
    }

    #[test]
    fn test_tag_order_does_not_change_blocks(
        tags in tags_strategy(),
        max_block_size in 2u16..=125,
        max_gap in 0u16..10,
    ) {
        let forward = build_blocks(&tags, max_block_size, max_gap).unwrap();
        let mut reversed = tags.clone();
        reversed.reverse();
        prop_assert_eq!(forward, build_blocks(&reversed, max_block_size, max_gap).unwrap());
    }

    #[test]
    fn test_blocks_start_and_end_on_tags(
        tags in tags_strategy(),
        max_block_size in 2u16..=125,
        max_gap in 0u16..10,
    ) {
        let blocks = build_blocks(&tags, max_block_size, max_gap).unwrap();
        for block in &blocks {
            let first = tags.iter().any(|t| t.read_address == block.address);
            let last = tags.iter().any(|t| t.end_address() == block.end_address());
            prop_assert!(first && last, "block {:?} is not bounded by tags", block);
        }
    }
}
