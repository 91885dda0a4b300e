//! Calldata encoding for every contract the engine sends transactions to.
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall};

sol! {
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
    }

    interface IStandardVault {
        function deposit(uint256 amount) external;
        function depositAll() external;
        function withdraw(uint256 shares) external;
        function withdrawAll() external;
    }

    interface IGovPool {
        function stake(uint256 amount) external;
        function withdraw(uint256 amount) external;
        function exit() external;
    }

    interface IClmVault {
        function deposit(uint256 amount0, uint256 amount1, uint256 minShares) external;
        function withdraw(uint256 shares, uint256 minAmount0, uint256 minAmount1) external;
        function withdrawAll(uint256 minAmount0, uint256 minAmount1) external;
    }

    interface IUniV2Zap {
        function beefIn(
            address beefyVault,
            uint256 tokenAmountOutMin,
            address tokenIn,
            uint256 tokenInAmount
        ) external;
        function beefInETH(address beefyVault, uint256 tokenAmountOutMin) external payable;
        function beefOut(address beefyVault, uint256 withdrawAmount) external;
        function beefOutAndSwap(
            address beefyVault,
            uint256 withdrawAmount,
            address desiredToken,
            uint256 desiredTokenOutMin
        ) external;
    }

    interface IZapRouter {
        struct Input {
            address token;
            uint256 amount;
        }

        struct Output {
            address token;
            uint256 minOutputAmount;
        }

        struct Relay {
            address target;
            uint256 value;
            bytes data;
        }

        struct Order {
            Input[] inputs;
            Output[] outputs;
            Relay relay;
            address user;
            address recipient;
        }

        struct StepToken {
            address token;
            int32 index;
        }

        struct Step {
            address target;
            uint256 value;
            bytes data;
            StepToken[] tokens;
        }

        function executeOrder(Order order, Step[] route) external payable;
    }

    interface IBridgeAndDeposit {
        function bridgeAndDeposit(
            address token,
            uint256 amount,
            uint64 dstChainId,
            address vault,
            address recipient,
            uint256 minShares
        ) external payable;
    }

    interface IStakingPool {
        function withdraw(uint256 amount) external;
    }
}

/// Byte offset of the first uint256 argument in calldata. The zap router writes its current
/// token balance there.
pub const FIRST_ARG_OFFSET: i32 = 4;

/// Marks a route token the router must approve but not inject into calldata.
pub const NO_INJECTION: i32 = -1;

pub fn encode_approve(spender: Address, amount: U256) -> Bytes {
    IERC20::approveCall { spender, amount }
        .abi_encode()
        .into()
}

pub fn encode_vault_deposit(amount: U256) -> Bytes {
    IStandardVault::depositCall { amount }
        .abi_encode()
        .into()
}

pub fn encode_vault_deposit_all() -> Bytes {
    IStandardVault::depositAllCall {}
        .abi_encode()
        .into()
}

pub fn encode_vault_withdraw(shares: U256) -> Bytes {
    IStandardVault::withdrawCall { shares }
        .abi_encode()
        .into()
}

pub fn encode_vault_withdraw_all() -> Bytes {
    IStandardVault::withdrawAllCall {}
        .abi_encode()
        .into()
}

pub fn encode_gov_stake(amount: U256) -> Bytes {
    IGovPool::stakeCall { amount }
        .abi_encode()
        .into()
}

pub fn encode_gov_withdraw(amount: U256) -> Bytes {
    IGovPool::withdrawCall { amount }
        .abi_encode()
        .into()
}

pub fn encode_gov_exit() -> Bytes {
    IGovPool::exitCall {}.abi_encode().into()
}

pub fn encode_clm_deposit(amount0: U256, amount1: U256, min_shares: U256) -> Bytes {
    IClmVault::depositCall { amount0, amount1, minShares: min_shares }
        .abi_encode()
        .into()
}

pub fn encode_clm_withdraw(shares: U256, min0: U256, min1: U256) -> Bytes {
    IClmVault::withdrawCall { shares, minAmount0: min0, minAmount1: min1 }
        .abi_encode()
        .into()
}

pub fn encode_clm_withdraw_all(min0: U256, min1: U256) -> Bytes {
    IClmVault::withdrawAllCall { minAmount0: min0, minAmount1: min1 }
        .abi_encode()
        .into()
}

pub fn encode_zap_in(vault: Address, min_swap_out: U256, token_in: Address, amount: U256) -> Bytes {
    IUniV2Zap::beefInCall {
        beefyVault: vault,
        tokenAmountOutMin: min_swap_out,
        tokenIn: token_in,
        tokenInAmount: amount,
    }
    .abi_encode()
    .into()
}

pub fn encode_zap_in_native(vault: Address, min_swap_out: U256) -> Bytes {
    IUniV2Zap::beefInETHCall { beefyVault: vault, tokenAmountOutMin: min_swap_out }
        .abi_encode()
        .into()
}

pub fn encode_zap_out(vault: Address, shares: U256) -> Bytes {
    IUniV2Zap::beefOutCall { beefyVault: vault, withdrawAmount: shares }
        .abi_encode()
        .into()
}

pub fn encode_zap_out_and_swap(
    vault: Address,
    shares: U256,
    desired: Address,
    min_out: U256,
) -> Bytes {
    IUniV2Zap::beefOutAndSwapCall {
        beefyVault: vault,
        withdrawAmount: shares,
        desiredToken: desired,
        desiredTokenOutMin: min_out,
    }
    .abi_encode()
    .into()
}

pub fn encode_execute_order(order: IZapRouter::Order, route: Vec<IZapRouter::Step>) -> Bytes {
    IZapRouter::executeOrderCall { order, route }
        .abi_encode()
        .into()
}

pub fn encode_bridge_and_deposit(
    token: Address,
    amount: U256,
    dst_chain_id: u64,
    vault: Address,
    recipient: Address,
    min_shares: U256,
) -> Bytes {
    IBridgeAndDeposit::bridgeAndDepositCall {
        token,
        amount,
        dstChainId: dst_chain_id,
        vault,
        recipient,
        minShares: min_shares,
    }
    .abi_encode()
    .into()
}

pub fn encode_unstake(amount: U256) -> Bytes {
    IStakingPool::withdrawCall { amount }
        .abi_encode()
        .into()
}

/// The 4 byte function selector of encoded calldata.
pub fn selector(data: &Bytes) -> Option<[u8; 4]> {
    data.get(..4)
        .and_then(|s| s.try_into().ok())
}
