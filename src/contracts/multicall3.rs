use ethers::prelude::abigen;

// Only the reads the balance engine needs; aggregate3 is encoded by hand in
// `crate::multicall` so the transport stays free of generated bindings.
abigen!(
    Multicall3,
    r#"[
        function getEthBalance(address addr) external view returns (uint256 balance)
    ]"#
);
