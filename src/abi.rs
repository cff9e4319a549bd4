//! Contract interfaces used by the quote estimator and swap executor.

use alloy_sol_types::sol;

sol! {
    /// UniswapV2-compatible router surface: constant-product quote plus
    /// the two single-path swap entrypoints.
    interface IUniswapV2Router {
        function getAmountsOut(uint256 amountIn, address[] path)
            external view returns (uint256[] amounts);

        function swapExactETHForTokens(
            uint256 amountOutMin,
            address[] path,
            address to,
            uint256 deadline
        ) external payable returns (uint256[] amounts);

        function swapExactTokensForETH(
            uint256 amountIn,
            uint256 amountOutMin,
            address[] path,
            address to,
            uint256 deadline
        ) external returns (uint256[] amounts);
    }

    /// The ERC-20 subset the engine touches.
    interface IERC20 {
        function approve(address spender, uint256 value) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function name() external view returns (string);
        function symbol() external view returns (string);
    }
}
