use cohsim_core::array::{CacheArray, CacheEvictBuffer, LineState};
use cohsim_core::common::PhysAddr;
use cohsim_core::directory::InfiniteDirectory;
use cohsim_core::maf::MissAddressFile;
use cohsim_core::policy::PolicyCore;
use mockall::mock;

mock! {
    pub Array {}
    impl CacheArray for Array {
        fn state(&self, addr: PhysAddr) -> LineState;
        fn set_state(&mut self, addr: PhysAddr, state: LineState);
        fn allocate(&mut self, addr: PhysAddr) -> Option<(PhysAddr, LineState)>;
        fn invalidate(&mut self, addr: PhysAddr);
        fn record_access(&mut self, addr: PhysAddr);
        fn eviction_pressure(&self) -> bool;
        fn preemptive_eviction(&mut self) -> Option<(PhysAddr, LineState)>;
        fn eviction_resources_available(&self) -> bool;
    }
}

/// A mock array that never pressures the bank and always has room to evict.
pub fn quiet_array() -> MockArray {
    let mut array = MockArray::new();
    let _ = array.expect_eviction_pressure().return_const(false);
    let _ = array.expect_eviction_resources_available().return_const(true);
    array
}

/// Bank 0 of a four-core system with an infinite directory around `array`.
pub fn core_with_array(array: MockArray) -> PolicyCore {
    PolicyCore {
        bank: 0,
        block_size: 64,
        cores: 4,
        evict_clean: false,
        maf: MissAddressFile::new(8),
        directory: Box::new(InfiniteDirectory::new(4)),
        cache_eb: CacheEvictBuffer::new(4),
        array: Box::new(array),
    }
}
