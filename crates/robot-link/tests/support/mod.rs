pub mod mock_robot;
