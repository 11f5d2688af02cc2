//! Write-path cache coverage tracking (spec §4.10): partial writes leave
//! gaps visible to `read`/`is_range_covered` until the gap is filled.

use super::common::Fixture;
use dittofs_core::store::ContentId;

#[tokio::test]
async fn partial_write_is_not_fully_covered_until_the_gap_closes() {
    let fx = Fixture::new();
    let id = ContentId(42);

    fx.cache.write_at(id, 0, &[1u8; 16]).await;
    fx.cache.write_at(id, 32, &[2u8; 16]).await;

    assert!(!fx.cache.is_range_covered(id, 0, 48).await);

    let mut buf = [0u8; 48];
    let (found_any, fully_covered) = fx.cache.read(id, 0, &mut buf).await;
    assert!(found_any);
    assert!(!fully_covered);

    fx.cache.write_at(id, 16, &[3u8; 16]).await;
    assert!(fx.cache.is_range_covered(id, 0, 48).await);

    let (found_any, fully_covered) = fx.cache.read(id, 0, &mut buf).await;
    assert!(found_any);
    assert!(fully_covered);
    assert_eq!(&buf[0..16], &[1u8; 16]);
    assert_eq!(&buf[16..32], &[3u8; 16]);
    assert_eq!(&buf[32..48], &[2u8; 16]);
}

#[tokio::test]
async fn untouched_content_id_reports_no_coverage() {
    let fx = Fixture::new();
    let id = ContentId(7);
    let mut buf = [0u8; 8];
    let (found_any, fully_covered) = fx.cache.read(id, 0, &mut buf).await;
    assert!(!found_any);
    assert!(!fully_covered);
}
